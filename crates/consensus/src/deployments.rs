//! Version-bits soft-fork deployments.

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum DeploymentId {
    TestDummy = 0,
    Csv = 1,
    Segwit = 2,
}

pub const DEFINED_DEPLOYMENTS: usize = 3;

pub const ALL_DEPLOYMENTS: [DeploymentId; DEFINED_DEPLOYMENTS] =
    [DeploymentId::TestDummy, DeploymentId::Csv, DeploymentId::Segwit];

impl DeploymentId {
    pub const fn as_usize(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeploymentId::TestDummy => "testdummy",
            DeploymentId::Csv => "csv",
            DeploymentId::Segwit => "segwit",
        }
    }
}

/// One BIP9 deployment: the signalling bit and the median-time window it may start in.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Deployment {
    pub bit_number: u8,
    pub start_time: u64,
    pub expire_time: u64,
}

impl Deployment {
    /// Start time that makes a deployment active from the first window on.
    pub const ALWAYS_START: u64 = 0;
    pub const NO_TIMEOUT: u64 = i64::MAX as u64;
}
