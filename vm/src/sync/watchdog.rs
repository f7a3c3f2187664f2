//! Deadline for spin loops in test builds.

#[cfg(test)]
use core::panic::Location;

/// How long a spin may last in test builds before it is reported.
#[cfg(test)]
const DEADLOCK_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);

/// Panics with "deadlock detected" once a spin has lasted two seconds,
/// naming where it started. Does nothing outside test builds.
pub struct Watchdog {
    #[cfg(test)]
    location: &'static Location<'static>,
    #[cfg(test)]
    started: std::time::Instant,
}

impl Watchdog {
    #[inline(always)]
    #[track_caller]
    pub fn start() -> Self {
        Self {
            #[cfg(test)]
            location: Location::caller(),
            #[cfg(test)]
            started: std::time::Instant::now(),
        }
    }

    #[inline(always)]
    pub fn check(&self) {
        #[cfg(test)]
        if self.started.elapsed() > DEADLOCK_TIMEOUT {
            panic!("deadlock detected at {}", self.location);
        }
    }
}
