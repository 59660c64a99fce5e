//! Error taxonomy of the chain controller.

use std::fmt;

use btcnode_storage::StoreError;

/// Stable identifiers for every consensus rule a block or transaction can break.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ErrorCode {
    DuplicateBlock,
    BlockTooBig,
    BlockWeightTooHigh,
    BlockVersionTooOld,
    InvalidTime,
    TimeTooOld,
    TimeTooNew,
    DifficultyTooLow,
    UnexpectedDifficulty,
    HighHash,
    BadMerkleRoot,
    BadCheckpoint,
    ForkTooOld,
    CheckpointTimeTooOld,
    NoTransactions,
    NoTxInputs,
    NoTxOutputs,
    TxTooBig,
    BadTxOutValue,
    DuplicateTxInputs,
    BadTxInput,
    MissingTxOut,
    UnfinalizedTx,
    DuplicateTx,
    OverwriteTx,
    ImmatureSpend,
    SpendTooHigh,
    BadFees,
    TooManySigOps,
    FirstTxNotCoinbase,
    MultipleCoinbases,
    BadCoinbaseScriptLen,
    BadCoinbaseValue,
    MissingCoinbaseHeight,
    BadCoinbaseHeight,
    ScriptMalformed,
    ScriptValidation,
    UnexpectedWitness,
    InvalidWitnessCommitment,
    WitnessCommitmentMismatch,
    PreviousBlockUnknown,
    InvalidAncestorBlock,
    PrevBlockNotBest,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::DuplicateBlock => "ErrDuplicateBlock",
            ErrorCode::BlockTooBig => "ErrBlockTooBig",
            ErrorCode::BlockWeightTooHigh => "ErrBlockWeightTooHigh",
            ErrorCode::BlockVersionTooOld => "ErrBlockVersionTooOld",
            ErrorCode::InvalidTime => "ErrInvalidTime",
            ErrorCode::TimeTooOld => "ErrTimeTooOld",
            ErrorCode::TimeTooNew => "ErrTimeTooNew",
            ErrorCode::DifficultyTooLow => "ErrDifficultyTooLow",
            ErrorCode::UnexpectedDifficulty => "ErrUnexpectedDifficulty",
            ErrorCode::HighHash => "ErrHighHash",
            ErrorCode::BadMerkleRoot => "ErrBadMerkleRoot",
            ErrorCode::BadCheckpoint => "ErrBadCheckpoint",
            ErrorCode::ForkTooOld => "ErrForkTooOld",
            ErrorCode::CheckpointTimeTooOld => "ErrCheckpointTimeTooOld",
            ErrorCode::NoTransactions => "ErrNoTransactions",
            ErrorCode::NoTxInputs => "ErrNoTxInputs",
            ErrorCode::NoTxOutputs => "ErrNoTxOutputs",
            ErrorCode::TxTooBig => "ErrTxTooBig",
            ErrorCode::BadTxOutValue => "ErrBadTxOutValue",
            ErrorCode::DuplicateTxInputs => "ErrDuplicateTxInputs",
            ErrorCode::BadTxInput => "ErrBadTxInput",
            ErrorCode::MissingTxOut => "ErrMissingTxOut",
            ErrorCode::UnfinalizedTx => "ErrUnfinalizedTx",
            ErrorCode::DuplicateTx => "ErrDuplicateTx",
            ErrorCode::OverwriteTx => "ErrOverwriteTx",
            ErrorCode::ImmatureSpend => "ErrImmatureSpend",
            ErrorCode::SpendTooHigh => "ErrSpendTooHigh",
            ErrorCode::BadFees => "ErrBadFees",
            ErrorCode::TooManySigOps => "ErrTooManySigOps",
            ErrorCode::FirstTxNotCoinbase => "ErrFirstTxNotCoinbase",
            ErrorCode::MultipleCoinbases => "ErrMultipleCoinbases",
            ErrorCode::BadCoinbaseScriptLen => "ErrBadCoinbaseScriptLen",
            ErrorCode::BadCoinbaseValue => "ErrBadCoinbaseValue",
            ErrorCode::MissingCoinbaseHeight => "ErrMissingCoinbaseHeight",
            ErrorCode::BadCoinbaseHeight => "ErrBadCoinbaseHeight",
            ErrorCode::ScriptMalformed => "ErrScriptMalformed",
            ErrorCode::ScriptValidation => "ErrScriptValidation",
            ErrorCode::UnexpectedWitness => "ErrUnexpectedWitness",
            ErrorCode::InvalidWitnessCommitment => "ErrInvalidWitnessCommitment",
            ErrorCode::WitnessCommitmentMismatch => "ErrWitnessCommitmentMismatch",
            ErrorCode::PreviousBlockUnknown => "ErrPreviousBlockUnknown",
            ErrorCode::InvalidAncestorBlock => "ErrInvalidAncestorBlock",
            ErrorCode::PrevBlockNotBest => "ErrPrevBlockNotBest",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A consensus rule violation: the block or transaction is invalid.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RuleError {
    pub code: ErrorCode,
    pub message: String,
}

impl RuleError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for RuleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for RuleError {}

/// An internal invariant was broken.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AssertError(pub String);

impl fmt::Display for AssertError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "assertion failed: {}", self.0)
    }
}

impl std::error::Error for AssertError {}

/// Malformed serialized chain data.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeserializeError(pub String);

impl DeserializeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl fmt::Display for DeserializeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for DeserializeError {}

#[derive(Debug)]
pub enum ChainError {
    Rule(RuleError),
    Assert(AssertError),
    Deserialize(DeserializeError),
    Store(StoreError),
    /// A caller asked for something the chain cannot answer, such as an inverted height range.
    InvalidRequest(String),
    Interrupted,
}

impl ChainError {
    pub fn is_rule_error(&self) -> bool {
        matches!(self, ChainError::Rule(_))
    }

    pub fn rule_code(&self) -> Option<ErrorCode> {
        match self {
            ChainError::Rule(err) => Some(err.code),
            _ => None,
        }
    }
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainError::Rule(err) => write!(f, "{err}"),
            ChainError::Assert(err) => write!(f, "{err}"),
            ChainError::Deserialize(err) => write!(f, "{err}"),
            ChainError::Store(err) => write!(f, "{err}"),
            ChainError::InvalidRequest(message) => write!(f, "{message}"),
            ChainError::Interrupted => write!(f, "interrupt requested"),
        }
    }
}

impl std::error::Error for ChainError {}

impl From<RuleError> for ChainError {
    fn from(err: RuleError) -> Self {
        ChainError::Rule(err)
    }
}

impl From<AssertError> for ChainError {
    fn from(err: AssertError) -> Self {
        ChainError::Assert(err)
    }
}

impl From<DeserializeError> for ChainError {
    fn from(err: DeserializeError) -> Self {
        ChainError::Deserialize(err)
    }
}

impl From<StoreError> for ChainError {
    fn from(err: StoreError) -> Self {
        ChainError::Store(err)
    }
}

pub(crate) fn rule_error(code: ErrorCode, message: impl Into<String>) -> ChainError {
    ChainError::Rule(RuleError::new(code, message))
}

pub(crate) fn assert_error(message: impl Into<String>) -> ChainError {
    ChainError::Assert(AssertError(message.into()))
}

/// Wraps a decode failure of store-managed bytes with the record it came from.
pub(crate) fn corruption(context: impl fmt::Display, err: impl fmt::Display) -> ChainError {
    ChainError::Store(StoreError::corruption(format!("{context}: {err}")))
}
