//! # Blocks

use crate::digest::DigestEncode;
use crate::entities::{block_num_from_id, BlockId, BlockTimestamp, Digest, Name, Signature};
use crate::errors::TypesError;
use crate::producer_schedule::ProducerAuthoritySchedule;
use crate::transaction::{Extension, TransactionReceipt};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

/// Header extension tag carrying newly activated protocol features.
pub const PROTOCOL_FEATURE_ACTIVATION_EXTENSION: u16 = 0;

/// Block header. Its digest, with the block number spliced in, is the id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BlockHeader {
    /// Production slot.
    pub timestamp: BlockTimestamp,
    /// Scheduled producer.
    pub producer: Name,
    /// Number of prior blocks this block confirms.
    pub confirmed: u16,
    /// Parent id.
    pub previous: BlockId,
    /// Merkle root of receipt digests.
    pub transaction_mroot: Digest,
    /// Merkle root of action receipt digests.
    pub action_mroot: Digest,
    /// Version of the active schedule that produced this block.
    pub schedule_version: u32,
    /// Schedule proposed to become pending with this block.
    pub new_producers: Option<ProducerAuthoritySchedule>,
    /// Header extensions.
    pub header_extensions: Vec<Extension>,
}

impl DigestEncode for BlockHeader {
    fn feed(&self, hasher: &mut Sha256) {
        self.timestamp.feed(hasher);
        self.producer.feed(hasher);
        self.confirmed.feed(hasher);
        self.previous.feed(hasher);
        self.transaction_mroot.feed(hasher);
        self.action_mroot.feed(hasher);
        self.schedule_version.feed(hasher);
        self.new_producers.feed(hasher);
        self.header_extensions.feed(hasher);
    }
}

impl BlockHeader {
    /// Number of this block.
    pub fn block_num(&self) -> u32 {
        block_num_from_id(&self.previous).wrapping_add(1)
    }

    /// Header id: digest with the block number in the first four bytes.
    pub fn calculate_id(&self) -> BlockId {
        let mut id = self.digest();
        id[..4].copy_from_slice(&self.block_num().to_be_bytes());
        id
    }

    /// Protocol features activated by this header, if any.
    pub fn protocol_feature_activation(&self) -> Result<Option<ProtocolFeatureActivation>, TypesError> {
        let mut found = None;
        for ext in &self.header_extensions {
            if ext.id != PROTOCOL_FEATURE_ACTIVATION_EXTENSION {
                return Err(TypesError::InvalidExtension(format!(
                    "unsupported header extension {}",
                    ext.id
                )));
            }
            if found.is_some() {
                return Err(TypesError::InvalidExtension(
                    "duplicate protocol feature activation extension".into(),
                ));
            }
            let activation: ProtocolFeatureActivation = bincode::deserialize(&ext.data)
                .map_err(|e| TypesError::Encoding(e.to_string()))?;
            activation.validate()?;
            found = Some(activation);
        }
        Ok(found)
    }
}

/// Header extension payload listing features activated in a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProtocolFeatureActivation {
    /// Feature digests, in activation order.
    pub protocol_features: Vec<Digest>,
}

impl ProtocolFeatureActivation {
    /// Rejects empty and duplicate activation lists.
    pub fn validate(&self) -> Result<(), TypesError> {
        if self.protocol_features.is_empty() {
            return Err(TypesError::InvalidExtension(
                "protocol feature activation extension must not be empty".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for digest in &self.protocol_features {
            if !seen.insert(digest) {
                return Err(TypesError::InvalidExtension(format!(
                    "duplicate protocol feature {}",
                    hex::encode(digest)
                )));
            }
        }
        Ok(())
    }

    /// Encode as a header extension.
    pub fn to_extension(&self) -> Result<Extension, TypesError> {
        Ok(Extension {
            id: PROTOCOL_FEATURE_ACTIVATION_EXTENSION,
            data: bincode::serialize(self).map_err(|e| TypesError::Encoding(e.to_string()))?,
        })
    }
}

/// Full block as produced and relayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SignedBlock {
    /// Header.
    pub header: BlockHeader,
    /// Producer signature over the header digest.
    pub producer_signature: Signature,
    /// Transaction receipts in execution order.
    pub transactions: Vec<TransactionReceipt>,
    /// Block extensions.
    pub block_extensions: Vec<Extension>,
}

impl SignedBlock {
    /// Wrap an unsigned header.
    pub fn from_header(header: BlockHeader) -> Self {
        Self {
            header,
            ..Default::default()
        }
    }

    /// Block id.
    pub fn id(&self) -> BlockId {
        self.header.calculate_id()
    }

    /// Block number.
    pub fn block_num(&self) -> u32 {
        self.header.block_num()
    }

    /// Parent id.
    pub fn previous(&self) -> &BlockId {
        &self.header.previous
    }
}
