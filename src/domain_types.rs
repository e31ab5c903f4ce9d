//! Domain types shared across the server
//!
//! Strongly-typed scalar values used by stage and server configuration to
//! prevent primitive obsession and keep validation in one place.

use nutype::nutype;
use uuid::Uuid;

/// Unique identifier for a job (connections are the primary job type)
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct JobId(Uuid);

impl JobId {
    /// Creates a new random job ID
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Capacity of a stage's bounded event queue
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1_000_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 1024
)]
pub struct QueueCapacity(usize);

impl QueueCapacity {
    /// Gets the value as usize
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Number of worker threads in a stage's pool
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1024),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct WorkerCount(usize);

impl WorkerCount {
    /// One worker, the default for the reader and writer stages
    #[must_use]
    pub fn single() -> Self {
        Self::try_new(1).expect("1 is a valid worker count")
    }

    /// One worker per CPU, the default for the handler stage
    #[must_use]
    pub fn per_cpu() -> Self {
        Self::try_new(num_cpus::get().max(1)).expect("cpu count is a valid worker count")
    }

    /// Gets the value as usize
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Priority of an event within a stage queue. Lower values dequeue earlier.
#[nutype(
    validate(less_or_equal = 1_000_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 1000
)]
pub struct EventPriority(u32);

impl EventPriority {
    /// The priority assigned to events that carry no explicit one
    #[must_use]
    pub fn normal() -> Self {
        Self::default()
    }

    /// A priority sorted after all normal-priority events, used for close
    /// markers that must let queued work finish first
    #[must_use]
    pub fn deferred() -> Self {
        Self::try_new(2000).expect("2000 is a valid priority")
    }

    /// Gets the value as u32
    #[must_use]
    pub fn as_u32(&self) -> u32 {
        self.into_inner()
    }
}

/// Listen backlog passed to `listen(2)`
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 65_535),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 128
)]
pub struct ListenBacklog(u32);

impl ListenBacklog {
    /// Gets the value as a C int for the `listen` call
    #[must_use]
    pub fn as_c_int(&self) -> libc::c_int {
        libc::c_int::try_from(self.into_inner()).unwrap_or(libc::c_int::MAX)
    }
}

/// Maximum number of simultaneously open connections
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1_000_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 10_000
)]
pub struct MaxConnections(usize);

impl MaxConnections {
    /// Gets the value as usize
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Idle-connection timeout in seconds
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 86_400),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 60
)]
pub struct IdleTimeoutSecs(u64);

impl IdleTimeoutSecs {
    /// Converts to a Duration
    #[must_use]
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.into_inner())
    }
}

/// Upper bound on the serialized size of a request head
#[nutype(
    validate(greater_or_equal = 256, less_or_equal = 1_048_576),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 16_384
)]
pub struct MaxHeaderBytes(usize);

impl MaxHeaderBytes {
    /// Gets the value as usize
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Reorder-buffer size at which the writer pauses a connection's output
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1_000_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 64
)]
pub struct HighWaterParts(usize);

impl HighWaterParts {
    /// Gets the value as usize
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Reorder-buffer byte total at which the writer pauses a connection's output
#[nutype(
    validate(greater_or_equal = 1024, less_or_equal = 1_073_741_824),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 4_194_304
)]
pub struct HighWaterBytes(usize);

impl HighWaterBytes {
    /// Gets the value as usize
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Reorder-buffer size below which a paused connection's output resumes
#[nutype(
    validate(less_or_equal = 1_000_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 16
)]
pub struct LowWaterParts(usize);

impl LowWaterParts {
    /// Gets the value as usize
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Reorder-buffer byte total below which a paused connection's output resumes
#[nutype(
    validate(less_or_equal = 1_073_741_824),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 1_048_576
)]
pub struct LowWaterBytes(usize);

impl LowWaterBytes {
    /// Gets the value as usize
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}
