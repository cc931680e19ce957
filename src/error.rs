use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SlotError {
    #[error(
        "No feasible slot found (alive: {alive_location_count}, feasible: \
         {feasible_location_count}, skipped by disk space: {skipped_by_disk_space}, \
         skipped by medium: {skipped_by_medium})"
    )]
    SlotNotFound {
        alive_location_count: usize,
        feasible_location_count: usize,
        skipped_by_disk_space: usize,
        skipped_by_medium: usize,
    },

    #[error("Scheduler jobs disabled: {0}")]
    SchedulerJobsDisabled(#[source] Box<SlotError>),

    #[error("Too many consecutive scheduler job abortions (max: {max})")]
    TooManyConsecutiveJobAbortions { max: usize },

    #[error("Too many consecutive GPU job failures (max: {max})")]
    TooManyConsecutiveGpuJobFailures { max: usize },

    #[error("Job proxy unavailable: {0}")]
    JobProxyUnavailable(String),

    #[error("GPU check command failed: {0}")]
    GpuCheckFailed(String),

    #[error("Location {location_id} refers to unknown medium {medium_name:?}")]
    UnknownMedium {
        location_id: String,
        medium_name: String,
    },

    #[error("Default medium {medium_name:?} is unknown")]
    UnknownDefaultMedium { medium_name: String },

    #[error("Medium {medium_name:?} has changed its index from {old_index} to {new_index}")]
    MediumIndexChanged {
        medium_name: String,
        old_index: i32,
        new_index: i32,
    },

    #[error("Location {location_id} is disabled: {reason}")]
    LocationDisabled { location_id: String, reason: String },

    #[error("Failed to initialize slot locations: {0}")]
    LocationInit(String),

    #[error("Failed to initialize volume manager: {0}")]
    VolumeManagerInit(String),

    #[error("Job environment is disabled")]
    EnvironmentDisabled,

    #[error("Node is not accepting jobs")]
    NotAcceptingJobs,

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for SlotError {
    fn from(err: std::io::Error) -> Self {
        SlotError::Io(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SlotError>;
