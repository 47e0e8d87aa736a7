//! NEAR transaction types.
//!
//! Only what `submit_result` needs: a single `FunctionCall` action signed
//! with an ed25519 key. Field order follows nearcore so the borsh encoding
//! matches what the node deserializes.

use std::io;

use borsh::BorshSerialize;
use sha2::{Digest, Sha256};

use super::signer::Signer;

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize)]
pub enum PublicKey {
    Ed25519([u8; 32]),
}

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize)]
pub enum Signature {
    Ed25519([u8; 64]),
}

/// A contract method call with JSON arguments.
#[derive(Debug, Clone, BorshSerialize)]
pub struct FunctionCall {
    pub method_name: String,
    pub args: Vec<u8>,
    pub gas: u64,
    pub deposit: u128,
}

/// Transaction actions. nearcore numbers its action variants and
/// `FunctionCall` is variant 2; the others are never sent by a worker.
#[derive(Debug, Clone)]
pub enum Action {
    FunctionCall(FunctionCall),
}

impl Action {
    const FUNCTION_CALL: u8 = 2;
}

impl BorshSerialize for Action {
    fn serialize<W: io::Write>(&self, writer: &mut W) -> io::Result<()> {
        match self {
            Self::FunctionCall(call) => {
                Self::FUNCTION_CALL.serialize(writer)?;
                call.serialize(writer)
            }
        }
    }
}

/// Unsigned transaction.
#[derive(Debug, Clone, BorshSerialize)]
pub struct Transaction {
    pub signer_id: String,
    pub public_key: PublicKey,
    pub nonce: u64,
    pub receiver_id: String,
    pub block_hash: [u8; 32],
    pub actions: Vec<Action>,
}

impl Transaction {
    /// SHA-256 of the borsh encoding; this is what gets signed.
    pub fn hash(&self) -> io::Result<[u8; 32]> {
        Ok(Sha256::digest(borsh::to_vec(self)?).into())
    }

    pub fn sign(self, signer: &Signer) -> io::Result<SignedTransaction> {
        let hash = self.hash()?;
        Ok(SignedTransaction {
            signature: Signature::Ed25519(signer.sign(&hash)),
            transaction: self,
            hash,
        })
    }
}

#[derive(Debug, Clone, BorshSerialize)]
pub struct SignedTransaction {
    pub transaction: Transaction,
    pub signature: Signature,
    #[borsh(skip)]
    hash: [u8; 32],
}

impl SignedTransaction {
    pub fn to_borsh(&self) -> io::Result<Vec<u8>> {
        borsh::to_vec(self)
    }

    /// Base58 transaction hash as reported by explorers.
    pub fn id(&self) -> String {
        bs58::encode(self.hash).into_string()
    }
}
