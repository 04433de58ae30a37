//! # Transactions and Receipts

use crate::digest::{sha256, DigestEncode};
use crate::entities::{
    block_num_from_id, ref_block_prefix, BlockId, Digest, Name, Signature, TimePointSec,
    TransactionId,
};
use crate::errors::TypesError;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

/// Opaque extension record attached to headers and transactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extension {
    /// Extension type tag.
    pub id: u16,
    /// Encoded payload.
    pub data: Vec<u8>,
}

impl DigestEncode for Extension {
    fn feed(&self, hasher: &mut Sha256) {
        self.id.feed(hasher);
        self.data.feed(hasher);
    }
}

/// An authorization on an action.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PermissionLevel {
    /// Authorizing account.
    pub actor: Name,
    /// Permission of that account.
    pub permission: Name,
}

impl DigestEncode for PermissionLevel {
    fn feed(&self, hasher: &mut Sha256) {
        self.actor.feed(hasher);
        self.permission.feed(hasher);
    }
}

/// A single contract invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    /// Contract account.
    pub account: Name,
    /// Action name.
    pub name: Name,
    /// Authorizations declared for this action.
    pub authorization: Vec<PermissionLevel>,
    /// Encoded arguments.
    pub data: Vec<u8>,
}

impl DigestEncode for Action {
    fn feed(&self, hasher: &mut Sha256) {
        self.account.feed(hasher);
        self.name.feed(hasher);
        self.authorization.feed(hasher);
        self.data.feed(hasher);
    }
}

/// Fields shared by every transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TransactionHeader {
    /// Time after which the transaction may not be included.
    pub expiration: TimePointSec,
    /// Low 16 bits of the referenced block number.
    pub ref_block_num: u16,
    /// Prefix of the referenced block id.
    pub ref_block_prefix: u32,
    /// Upper bound on billed net usage, in 8-byte words (0 = unlimited).
    pub max_net_usage_words: u32,
    /// Upper bound on billed cpu, in milliseconds (0 = unlimited).
    pub max_cpu_usage_ms: u8,
    /// Requested execution delay.
    pub delay_sec: u32,
}

impl DigestEncode for TransactionHeader {
    fn feed(&self, hasher: &mut Sha256) {
        self.expiration.feed(hasher);
        self.ref_block_num.feed(hasher);
        self.ref_block_prefix.feed(hasher);
        self.max_net_usage_words.feed(hasher);
        self.max_cpu_usage_ms.feed(hasher);
        self.delay_sec.feed(hasher);
    }
}

/// An unsigned transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Transaction {
    /// Header fields.
    pub header: TransactionHeader,
    /// Actions that run without authorization.
    pub context_free_actions: Vec<Action>,
    /// Authorized actions.
    pub actions: Vec<Action>,
    /// Extensions; rejected unless a feature recognises them.
    pub transaction_extensions: Vec<Extension>,
}

impl DigestEncode for Transaction {
    fn feed(&self, hasher: &mut Sha256) {
        self.header.feed(hasher);
        self.context_free_actions.feed(hasher);
        self.actions.feed(hasher);
        self.transaction_extensions.feed(hasher);
    }
}

impl Transaction {
    /// Transaction id.
    pub fn id(&self) -> TransactionId {
        self.digest()
    }

    /// Point the TaPoS fields at a block.
    pub fn set_reference_block(&mut self, reference: &BlockId) {
        self.header.ref_block_num = (block_num_from_id(reference) & 0xffff) as u16;
        self.header.ref_block_prefix = ref_block_prefix(reference);
    }

    /// Check the TaPoS fields against a block id.
    pub fn verify_reference_block(&self, reference: &BlockId) -> bool {
        self.header.ref_block_num == (block_num_from_id(reference) & 0xffff) as u16
            && self.header.ref_block_prefix == ref_block_prefix(reference)
    }

    /// Actor of the first authorization of the first action.
    pub fn first_authorizer(&self) -> Option<&Name> {
        self.actions
            .iter()
            .flat_map(|a| a.authorization.iter())
            .map(|p| &p.actor)
            .next()
    }
}

/// A transaction together with its signatures and context-free data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PackedTransaction {
    /// Signatures over the transaction digest.
    pub signatures: Vec<Signature>,
    /// Data for context-free actions; prunable.
    pub context_free_data: Vec<Vec<u8>>,
    /// The transaction itself.
    pub transaction: Transaction,
}

impl PackedTransaction {
    /// Wrap a transaction and its signatures.
    pub fn new(transaction: Transaction, signatures: Vec<Signature>) -> Self {
        Self {
            signatures,
            context_free_data: Vec::new(),
            transaction,
        }
    }

    /// Transaction id.
    pub fn id(&self) -> TransactionId {
        self.transaction.id()
    }

    /// Digest of the prunable part.
    pub fn prunable_digest(&self) -> Digest {
        let mut hasher = Sha256::new();
        self.signatures.feed(&mut hasher);
        self.context_free_data.feed(&mut hasher);
        hasher.finalize().into()
    }

    /// Digest committed to by a receipt: transaction plus prunable digest.
    pub fn packed_digest(&self) -> Digest {
        let mut hasher = Sha256::new();
        self.prunable_digest().feed(&mut hasher);
        self.transaction.feed(&mut hasher);
        hasher.finalize().into()
    }

    /// Encoded size of the unprunable part.
    pub fn unprunable_size(&self) -> Result<usize, TypesError> {
        let size = bincode::serialized_size(&self.transaction)
            .map_err(|e| TypesError::Encoding(e.to_string()))?;
        Ok(size as usize)
    }

    /// Encoded size of the prunable part.
    pub fn prunable_size(&self) -> Result<usize, TypesError> {
        let size = bincode::serialized_size(&(&self.signatures, &self.context_free_data))
            .map_err(|e| TypesError::Encoding(e.to_string()))?;
        Ok(size as usize)
    }

    /// Length of all signatures combined.
    pub fn signature_bytes(&self) -> usize {
        self.signatures.iter().map(Vec::len).sum()
    }
}

/// Outcome recorded in a receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionStatus {
    /// Succeeded; no error handler executed.
    Executed,
    /// Objectively failed, error handler succeeded.
    SoftFail,
    /// Objectively failed, error handler failed too.
    HardFail,
    /// Scheduled for later execution.
    Delayed,
    /// Expired and retired without execution.
    Expired,
}

impl TransactionStatus {
    fn tag(self) -> u8 {
        match self {
            Self::Executed => 0,
            Self::SoftFail => 1,
            Self::HardFail => 2,
            Self::Delayed => 3,
            Self::Expired => 4,
        }
    }
}

/// Billing part of a receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionReceiptHeader {
    /// Outcome.
    pub status: TransactionStatus,
    /// Billed cpu in microseconds.
    pub cpu_usage_us: u32,
    /// Billed net usage in 8-byte words.
    pub net_usage_words: u32,
}

impl DigestEncode for TransactionReceiptHeader {
    fn feed(&self, hasher: &mut Sha256) {
        self.status.tag().feed(hasher);
        self.cpu_usage_us.feed(hasher);
        self.net_usage_words.feed(hasher);
    }
}

/// What a receipt refers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiptTrx {
    /// A scheduled transaction, by id.
    Id(TransactionId),
    /// A full input transaction.
    Packed(PackedTransaction),
}

/// Receipt included verbatim in a block body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionReceipt {
    /// Billing and status.
    pub header: TransactionReceiptHeader,
    /// Receipt content.
    pub trx: ReceiptTrx,
}

impl TransactionReceipt {
    /// Id of the referenced transaction.
    pub fn trx_id(&self) -> TransactionId {
        match &self.trx {
            ReceiptTrx::Id(id) => *id,
            ReceiptTrx::Packed(packed) => packed.id(),
        }
    }

    /// Leaf committed to by the transaction merkle root.
    pub fn digest(&self) -> Digest {
        let mut hasher = Sha256::new();
        self.header.feed(&mut hasher);
        match &self.trx {
            ReceiptTrx::Id(id) => {
                0u8.feed(&mut hasher);
                id.feed(&mut hasher);
            }
            ReceiptTrx::Packed(packed) => {
                1u8.feed(&mut hasher);
                packed.packed_digest().feed(&mut hasher);
            }
        }
        hasher.finalize().into()
    }
}

/// Digest over arbitrary bytes, used by action receipts.
pub fn action_digest(bytes: &[u8]) -> Digest {
    sha256(bytes)
}
