//! Driver context: the owned root handed to the agents.
//!
//! Creates the per-instance directory, the cnc file with its five
//! sections, the counters manager, the system counters, the distinct
//! error log, and the loss report.  Refuses to start over a directory
//! with an actively-heartbeating driver.

use std::path::PathBuf;
use std::sync::Arc;

use cn_concurrent::cnc::{self, CncFile, CncLayout};
use cn_concurrent::counters::METADATA_LENGTH;
use cn_concurrent::error_log::DistinctErrorLog;
use cn_concurrent::mapped::MappedFile;
use cn_concurrent::ring_buffer::ManyToOneRingBuffer;
use cn_concurrent::time::{EpochClock, NanoClock};
use cn_concurrent::{broadcast, CountersManager};
use tracing::info;

use crate::config::DriverConfig;
use crate::error::DriverError;
use crate::loss_report::LossReport;
use crate::system_counters::SystemCounters;

/// Shared driver state created at startup.
///
/// The mapped files owned here back every buffer view handed to the
/// agents; whoever takes this context must keep it (or its mappings)
/// alive for the driver's lifetime.
pub struct DriverContext {
    pub config: DriverConfig,
    pub cnc: Arc<CncFile>,
    pub counters_manager: CountersManager,
    pub system_counters: Arc<SystemCounters>,
    pub error_log: Arc<DistinctErrorLog>,
    pub loss_report: LossReport,
    pub nano_clock: Arc<NanoClock>,
    pub loss_report_file: MappedFile,
    pub publications_dir: PathBuf,
    pub images_dir: PathBuf,
}

impl DriverContext {
    pub fn launch(config: DriverConfig) -> Result<DriverContext, DriverError> {
        config.validate()?;

        let now_ms = EpochClock::millis();
        if config.dir.exists() {
            if cnc::is_driver_active(&config.dir, now_ms, config.driver_timeout_ms) {
                return Err(DriverError::Configuration(format!(
                    "an active driver is already running in '{}'",
                    config.dir.display()
                )));
            }
            if config.dir_delete_on_start {
                std::fs::remove_dir_all(&config.dir)?;
            }
        }

        let publications_dir = config.dir.join("publications");
        let images_dir = config.dir.join("images");
        std::fs::create_dir_all(&publications_dir)?;
        std::fs::create_dir_all(&images_dir)?;

        let max_counters = config.counters_values_buffer_length
            / cn_concurrent::counters::VALUE_LENGTH;
        let layout = CncLayout {
            to_driver_length: config.to_driver_buffer_length,
            to_clients_length: config.to_clients_buffer_length,
            counters_metadata_length: max_counters * METADATA_LENGTH,
            counters_values_length: config.counters_values_buffer_length,
            error_log_length: config.error_buffer_length,
        };
        let cnc = CncFile::create(
            &config.dir,
            layout,
            config.client_liveness_timeout_ns,
            now_ms,
            config.file_page_size,
        )
        .map_err(|e| DriverError::Configuration(e.to_string()))?;

        // Sanity-check the shared sections before agents touch them.
        ManyToOneRingBuffer::new(cnc.to_driver_buffer())
            .map_err(|e| DriverError::Configuration(e.to_string()))?;
        broadcast::BroadcastTransmitter::new(cnc.to_clients_buffer())
            .map_err(|e| DriverError::Configuration(e.to_string()))?;

        let mut counters_manager = CountersManager::new(
            cnc.counters_metadata_buffer(),
            cnc.counters_values_buffer(),
            config.counter_free_to_reuse_timeout_ns / 1_000_000,
        );
        let system_counters = Arc::new(
            SystemCounters::allocate(&mut counters_manager, now_ms)
                .map_err(|e| DriverError::Configuration(e.to_string()))?,
        );

        let error_log = Arc::new(DistinctErrorLog::new(cnc.error_log_buffer()));

        let loss_report_file = MappedFile::create(
            &config.dir.join("loss-report.dat"),
            config.loss_report_buffer_length,
        )
        .map_err(|e| DriverError::Configuration(e.to_string()))?;
        let loss_report = LossReport::new(loss_report_file.buffer());

        info!(
            dir = %config.dir.display(),
            pid = cnc.pid(),
            "driver context initialized"
        );

        Ok(DriverContext {
            config,
            cnc: Arc::new(cnc),
            counters_manager,
            system_counters,
            error_log,
            loss_report,
            nano_clock: Arc::new(NanoClock::new()),
            loss_report_file,
            publications_dir,
            images_dir,
        })
    }

    pub fn publication_log_path(&self, registration_id: i64) -> PathBuf {
        self.publications_dir
            .join(format!("{registration_id}.logbuffer"))
    }

    pub fn image_log_path(&self, correlation_id: i64) -> PathBuf {
        self.images_dir.join(format!("{correlation_id}.logbuffer"))
    }

    pub fn loss_report_path(&self) -> PathBuf {
        self.loss_report_file.path().to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriverConfig;

    fn test_config(dir: &std::path::Path) -> DriverConfig {
        DriverConfig {
            dir: dir.to_path_buf(),
            term_buffer_length: 64 * 1024,
            ipc_term_buffer_length: 64 * 1024,
            initial_window_length: 16 * 1024,
            ..DriverConfig::default()
        }
    }

    #[test]
    fn launch_creates_directory_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("conduit-test");
        let context = DriverContext::launch(test_config(&dir)).unwrap();

        assert!(dir.join("cnc.dat").exists());
        assert!(dir.join("publications").is_dir());
        assert!(dir.join("images").is_dir());
        assert!(dir.join("loss-report.dat").exists());
        assert!(context.publication_log_path(7).ends_with("publications/7.logbuffer"));
    }

    #[test]
    fn refuses_directory_with_live_heartbeat() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("conduit-live");
        let context = DriverContext::launch(test_config(&dir)).unwrap();

        // Simulate a live driver heartbeating in the directory.
        let ring = ManyToOneRingBuffer::new(context.cnc.to_driver_buffer()).unwrap();
        ring.update_consumer_heartbeat(EpochClock::millis());

        assert!(matches!(
            DriverContext::launch(test_config(&dir)),
            Err(DriverError::Configuration(_))
        ));
    }
}
