//! Node-local actor, contract, action and key lists.
//!
//! Whitelists win over blacklists: a non-empty whitelist makes the
//! corresponding blacklist irrelevant. All failures are subjective.

use crate::config::ControllerConfig;
use crate::error::{ChainError, ChainResult};
use shared_types::{short_id, Name, PublicKey, Transaction};
use std::collections::BTreeSet;

fn join(names: &[&Name]) -> String {
    names
        .iter()
        .map(|n| n.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn check_actor_list(config: &ControllerConfig, actors: &BTreeSet<Name>) -> ChainResult<()> {
    if !config.actor_whitelist.is_empty() {
        let excluded: Vec<&Name> = actors.difference(&config.actor_whitelist).collect();
        if !excluded.is_empty() {
            return Err(ChainError::ActorWhitelist(format!(
                "authorizing actor(s) in transaction are not on the actor whitelist: {}",
                join(&excluded)
            )));
        }
    } else if !config.actor_blacklist.is_empty() {
        let blacklisted: Vec<&Name> = actors.intersection(&config.actor_blacklist).collect();
        if !blacklisted.is_empty() {
            return Err(ChainError::ActorBlacklist(format!(
                "authorizing actor(s) in transaction are on the actor blacklist: {}",
                join(&blacklisted)
            )));
        }
    }
    Ok(())
}

pub fn check_contract_list(config: &ControllerConfig, code: &Name) -> ChainResult<()> {
    if !config.contract_whitelist.is_empty() {
        if !config.contract_whitelist.contains(code) {
            return Err(ChainError::ContractWhitelist(format!(
                "account '{code}' is not on the contract whitelist"
            )));
        }
    } else if config.contract_blacklist.contains(code) {
        return Err(ChainError::ContractBlacklist(format!(
            "account '{code}' is on the contract blacklist"
        )));
    }
    Ok(())
}

pub fn check_action_list(config: &ControllerConfig, code: &Name, action: &Name) -> ChainResult<()> {
    if config
        .action_blacklist
        .contains(&(code.clone(), action.clone()))
    {
        return Err(ChainError::ActionBlacklist(format!(
            "action '{code}::{action}' is on the action blacklist"
        )));
    }
    Ok(())
}

pub fn check_key_list(config: &ControllerConfig, key: &PublicKey) -> ChainResult<()> {
    if config.key_blacklist.contains(key) {
        return Err(ChainError::KeyBlacklist(format!(
            "public key '{}' is on the key blacklist",
            hex::encode(key)
        )));
    }
    Ok(())
}

pub fn sender_avoids_whitelist_blacklist_enforcement(config: &ControllerConfig, sender: &Name) -> bool {
    config.sender_bypass_whiteblacklist.contains(sender)
}

/// Contract and action lists for one action. `sender` is the account that
/// sent an inline action; top-level actions have none.
pub fn check_action_lists(
    config: &ControllerConfig,
    sender: Option<&Name>,
    receiver: &Name,
    action: &Name,
) -> ChainResult<()> {
    if let Some(sender) = sender {
        if sender_avoids_whitelist_blacklist_enforcement(config, sender) {
            return Ok(());
        }
    }
    check_contract_list(config, receiver)?;
    check_action_list(config, receiver, action)
}

/// Every list check that applies to an input transaction before execution.
pub fn enforce_transaction_lists(
    config: &ControllerConfig,
    trx: &Transaction,
    recovered_keys: &BTreeSet<PublicKey>,
) -> ChainResult<()> {
    let actors: BTreeSet<Name> = trx
        .actions
        .iter()
        .flat_map(|a| a.authorization.iter().map(|p| p.actor.clone()))
        .collect();
    check_actor_list(config, &actors)?;
    for act in trx.context_free_actions.iter().chain(trx.actions.iter()) {
        check_action_lists(config, None, &act.account, &act.name)?;
    }
    for key in recovered_keys {
        check_key_list(config, key)?;
    }
    Ok(())
}

/// Longest signature allowed by this node, checked while producing.
pub fn check_signature_sizes(config: &ControllerConfig, trx_id: &shared_types::TransactionId, signatures: &[Vec<u8>]) -> ChainResult<()> {
    let limit = config.maximum_variable_signature_length;
    if let Some(sig) = signatures.iter().find(|s| s.len() > limit) {
        return Err(ChainError::SigVariableSizeLimit(format!(
            "signature of {} bytes in transaction {} exceeds the limit of {limit} bytes",
            sig.len(),
            short_id(trx_id)
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_types::{Action, PermissionLevel};

    fn names(list: &[&str]) -> BTreeSet<Name> {
        list.iter().map(|n| Name::from(*n)).collect()
    }

    fn trx(actor: &str, contract: &str, action: &str) -> Transaction {
        Transaction {
            actions: vec![Action {
                account: Name::from(contract),
                name: Name::from(action),
                authorization: vec![PermissionLevel {
                    actor: Name::from(actor),
                    permission: Name::from("active"),
                }],
                data: Vec::new(),
            }],
            ..Transaction::default()
        }
    }

    #[test]
    fn test_whitelist_must_cover_all_actors() {
        let config = ControllerConfig {
            actor_whitelist: names(&["alice"]),
            actor_blacklist: names(&["alice"]),
            ..ControllerConfig::default()
        };
        assert!(check_actor_list(&config, &names(&["alice"])).is_ok());
        assert!(matches!(
            check_actor_list(&config, &names(&["alice", "bob"])),
            Err(ChainError::ActorWhitelist(_))
        ));
    }

    #[test]
    fn test_blacklist_applies_without_whitelist() {
        let config = ControllerConfig {
            actor_blacklist: names(&["mallory"]),
            contract_blacklist: names(&["evil"]),
            ..ControllerConfig::default()
        };
        assert!(matches!(
            enforce_transaction_lists(&config, &trx("mallory", "token", "transfer"), &BTreeSet::new()),
            Err(ChainError::ActorBlacklist(_))
        ));
        assert!(matches!(
            enforce_transaction_lists(&config, &trx("alice", "evil", "transfer"), &BTreeSet::new()),
            Err(ChainError::ContractBlacklist(_))
        ));
        assert!(enforce_transaction_lists(&config, &trx("alice", "token", "transfer"), &BTreeSet::new()).is_ok());
    }

    #[test]
    fn test_action_and_key_blacklists() {
        let config = ControllerConfig {
            action_blacklist: [(Name::from("token"), Name::from("burn"))].into_iter().collect(),
            key_blacklist: [b"bad".to_vec()].into_iter().collect(),
            ..ControllerConfig::default()
        };
        assert!(matches!(
            enforce_transaction_lists(&config, &trx("alice", "token", "burn"), &BTreeSet::new()),
            Err(ChainError::ActionBlacklist(_))
        ));
        let keys: BTreeSet<PublicKey> = [b"bad".to_vec()].into_iter().collect();
        assert!(matches!(
            enforce_transaction_lists(&config, &trx("alice", "token", "transfer"), &keys),
            Err(ChainError::KeyBlacklist(_))
        ));
    }

    #[test]
    fn test_bypassed_sender_skips_contract_lists() {
        let config = ControllerConfig {
            contract_whitelist: names(&["token"]),
            sender_bypass_whiteblacklist: names(&["relay"]),
            ..ControllerConfig::default()
        };
        let receiver = Name::from("other");
        let action = Name::from("notify");
        assert!(check_action_lists(&config, None, &receiver, &action).is_err());
        assert!(check_action_lists(&config, Some(&Name::from("relay")), &receiver, &action).is_ok());
    }

    #[test]
    fn test_oversized_signature_rejected() {
        let config = ControllerConfig {
            maximum_variable_signature_length: 4,
            ..ControllerConfig::default()
        };
        assert!(check_signature_sizes(&config, &[0u8; 32], &[vec![0; 4]]).is_ok());
        assert!(matches!(
            check_signature_sizes(&config, &[0u8; 32], &[vec![0; 5]]),
            Err(ChainError::SigVariableSizeLimit(_))
        ));
    }
}
