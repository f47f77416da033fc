use std::net::IpAddr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("database error: {0}")]
    Database(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("subnet not found: {0}")]
    SubnetNotFound(u64),

    #[error("IP range not found: {0}")]
    IpRangeNotFound(u64),

    #[error("static IP address not found: {0}")]
    StaticIpNotFound(u64),

    #[error("static route not found: {0}")]
    StaticRouteNotFound(u64),

    #[error("duplicate subnet: {0}")]
    DuplicateSubnet(String),

    #[error("invalid subnet: {0}")]
    InvalidSubnet(String),

    #[error("invalid IP range: {0}")]
    InvalidRange(String),

    /// The caller asked for an alloc type that cannot be allocated directly,
    /// or omitted the owner of a USER_RESERVED address.
    #[error("invalid allocation type: {0}")]
    InvalidAllocationType(String),

    #[error("IP address {address} is not within subnet CIDR {cidr}")]
    AddressOutOfRange { address: IpAddr, cidr: String },

    #[error("IP address unavailable: {0}")]
    AddressUnavailable(String),

    #[error("no more IP addresses available in subnet {cidr}")]
    AddressExhaustion { cidr: String },

    #[error("IP range overlap: {0}")]
    RangeOverlap(String),

    /// Two allocations raced for the same address. The whole selection must
    /// be re-run.
    #[error("allocation of {address} raced with a concurrent allocation")]
    RetryableConflict { address: IpAddr },

    #[error("could not allocate an IP address after {attempts} attempts, try again")]
    AllocationConflict { attempts: u32 },

    #[error("cannot delete subnet {cidr}: dynamic range {start}-{end} is still defined")]
    SubnetInUse {
        cidr: String,
        start: IpAddr,
        end: IpAddr,
    },

    /// Store-level violation of the static-family address uniqueness index.
    #[error("unique violation: {address} is already claimed by static IP {existing_id}")]
    UniqueViolation { address: IpAddr, existing_id: u64 },

    /// A lifecycle operation was applied to a row in the wrong state.
    #[error("invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("foreign key violation: {0}")]
    ForeignKey(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for errors a caller should answer by re-running the whole
    /// allocation sequence.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::RetryableConflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

// Blanket From impls for redb error types
impl From<redb::Error> for Error {
    fn from(e: redb::Error) -> Self {
        Error::Database(e.to_string())
    }
}

impl From<redb::StorageError> for Error {
    fn from(e: redb::StorageError) -> Self {
        Error::Database(e.to_string())
    }
}

impl From<redb::TableError> for Error {
    fn from(e: redb::TableError) -> Self {
        Error::Database(e.to_string())
    }
}

impl From<redb::TransactionError> for Error {
    fn from(e: redb::TransactionError) -> Self {
        Error::Database(e.to_string())
    }
}

impl From<redb::CommitError> for Error {
    fn from(e: redb::CommitError) -> Self {
        Error::Database(e.to_string())
    }
}

impl From<redb::DatabaseError> for Error {
    fn from(e: redb::DatabaseError) -> Self {
        Error::Database(e.to_string())
    }
}
