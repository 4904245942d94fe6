use std::{net::SocketAddr, time::Duration};

use rkyv::{Archive, Deserialize, Serialize};
use typed_builder::TypedBuilder;

fn loopback() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

/// Settings of one worker process.
///
/// A worker with no brokers runs standalone: every task it spawns stays local
/// and both watermarks are infinite, so no network traffic is ever needed.
#[derive(TypedBuilder, Clone, Debug)]
pub struct WorkerConfig {
    /// Brokers to connect to. More may be learned from the first INIT reply.
    #[builder(default, setter(into))]
    pub brokers: Vec<String>,
    /// Local endpoint for direct peer-to-peer replies.
    #[builder(default = loopback())]
    pub bind: SocketAddr,
    /// Host advertised to peers; defaults to the bound IP.
    #[builder(default, setter(strip_option, into))]
    pub advertise_host: Option<String>,
    /// The origin owns the root task and its completion ends the job.
    #[builder(default)]
    pub origin: bool,
    /// Below this many movable tasks the queue asks the broker for more work.
    #[builder(default = 1)]
    pub low_watermark: usize,
    /// Above this many movable tasks the oldest are shipped back out.
    #[builder(default = 32)]
    pub high_watermark: usize,
    #[builder(default = Duration::from_millis(50))]
    pub poll_interval: Duration,
    /// How long a shipped task may stay unanswered before its status is asked.
    #[builder(default = Duration::from_secs(10))]
    pub status_interval: Duration,
    #[builder(default = Duration::from_secs(5))]
    pub connect_timeout: Duration,
    #[builder(default = Duration::from_secs(1))]
    pub keep_alive: Duration,
    /// Send replies straight to the owner's endpoint instead of through the
    /// broker, falling back to the broker when that fails.
    #[builder(default = true)]
    pub direct_replies: bool,
    /// Frames bodies larger than this are zstd-compressed.
    #[builder(default = Some(64 * 1024))]
    pub compression_threshold: Option<usize>,
    /// Stack size of the threads that carry task continuations.
    #[builder(default = 1024 * 1024)]
    pub stack_size: usize,
    #[builder(default = String::from("shoal"), setter(into))]
    pub job_name: String,
    /// Whether the origin broadcasts SHUTDOWN once its root task is done.
    #[builder(default = true)]
    pub shutdown_on_exit: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl WorkerConfig {
    pub fn is_standalone(&self) -> bool {
        self.brokers.is_empty()
    }

    /// `(low, high)` as the queue should apply them.
    pub fn watermarks(&self) -> (usize, usize) {
        if self.is_standalone() {
            (usize::MAX, usize::MAX)
        } else {
            (self.low_watermark, self.high_watermark.max(1))
        }
    }

    pub fn job(&self) -> JobConfig {
        JobConfig {
            name: self.job_name.clone(),
            low_watermark: self.low_watermark as u64,
            high_watermark: self.high_watermark as u64,
        }
    }

    /// Adopts the job-wide settings published by the origin.
    pub fn adopt(&mut self, job: &JobConfig) {
        self.job_name = job.name.clone();
        self.low_watermark = job.low_watermark as usize;
        self.high_watermark = job.high_watermark as usize;
    }
}

/// Job-wide settings. The broker keeps the origin's copy and hands it to every
/// worker that joins later.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct JobConfig {
    pub name: String,
    pub low_watermark: u64,
    pub high_watermark: u64,
}

/// Which unassigned task a REQUEST is served with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DispatchPolicy {
    /// Most recently queued first, favouring recently active work.
    #[default]
    Lifo,
    /// Oldest first.
    Fifo,
}

#[derive(TypedBuilder, Clone, Debug)]
pub struct BrokerConfig {
    #[builder(default = loopback())]
    pub bind: SocketAddr,
    #[builder(default, setter(strip_option, into))]
    pub advertise_host: Option<String>,
    /// Brokers to federate with on startup.
    #[builder(default, setter(into))]
    pub peers: Vec<String>,
    #[builder(default)]
    pub dispatch: DispatchPolicy,
    #[builder(default = Duration::from_secs(1))]
    pub keep_alive: Duration,
    #[builder(default = Some(64 * 1024))]
    pub compression_threshold: Option<usize>,
    #[builder(default = Duration::from_secs(5))]
    pub connect_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standalone_watermarks_are_infinite() {
        let config = WorkerConfig::default();
        assert!(config.is_standalone());
        assert_eq!(config.watermarks(), (usize::MAX, usize::MAX));
    }

    #[test]
    fn networked_watermarks_follow_config() {
        let config = WorkerConfig::builder()
            .brokers(vec!["127.0.0.1:5555".to_string()])
            .low_watermark(2)
            .high_watermark(0)
            .build();
        assert_eq!(config.watermarks(), (2, 1));
    }

    #[test]
    fn adopts_origin_job() {
        let mut config = WorkerConfig::default();
        config.adopt(&JobConfig {
            name: "sweep".into(),
            low_watermark: 3,
            high_watermark: 9,
        });
        assert_eq!(config.job_name, "sweep");
        assert_eq!(config.low_watermark, 3);
        assert_eq!(config.high_watermark, 9);
    }
}
