//! Media driver assembly: wires the agents together and runs them under
//! the configured threading mode.
//!
//! - `dedicated`: one thread per agent.
//! - `shared-network`: conductor on its own thread, sender + receiver
//!   multiplexed on a second.
//! - `shared`: all three agents multiplexed on one thread.
//! - `invoker`: no threads; the hosting application calls
//!   [`MediaDriver::do_work`] from its own loop.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use cn_concurrent::queues::{CommandQueue, TaskQueue};
use cn_concurrent::time::CachedClock;
use cn_concurrent::IdleStrategy;
use tracing::info;

use crate::conductor::DriverConductor;
use crate::config::{DriverConfig, ThreadingMode};
use crate::context::DriverContext;
use crate::error::DriverError;
use crate::proxy::{ConductorProxy, ReceiverProxy, SenderProxy};
use crate::receiver::Receiver;
use crate::sender::Sender;

/// Capacity of each Conductor->agent command queue.
const COMMAND_QUEUE_CAPACITY: usize = 1024;

/// The three agents, available directly in invoker mode.
pub struct DriverAgents {
    pub conductor: DriverConductor,
    pub sender: Sender,
    pub receiver: Receiver,
}

impl DriverAgents {
    /// One pass over every agent; the invoker-mode duty cycle.
    pub fn do_work(&mut self) -> usize {
        self.conductor.do_work() + self.sender.do_work() + self.receiver.do_work()
    }
}

/// A running media driver.
pub struct MediaDriver {
    dir: PathBuf,
    terminate: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
    agents: Option<DriverAgents>,
}

impl MediaDriver {
    /// Build the context and agents, then start threads per the threading
    /// mode.  In invoker mode no threads start; drive with `do_work`.
    pub fn launch(config: DriverConfig) -> Result<MediaDriver, DriverError> {
        let threading_mode = config.threading_mode;
        let dir = config.dir.clone();
        let context = DriverContext::launch(config)?;

        let terminate = Arc::new(AtomicBool::new(false));
        let sender_queue = Arc::new(CommandQueue::with_capacity(COMMAND_QUEUE_CAPACITY));
        let receiver_queue = Arc::new(CommandQueue::with_capacity(COMMAND_QUEUE_CAPACITY));
        let tasks = Arc::new(TaskQueue::new());

        let sender_clock = Arc::new(CachedClock::new());
        let receiver_clock = Arc::new(CachedClock::new());
        let conductor_clock = Arc::new(CachedClock::new());

        let sender = Sender::new(
            Arc::clone(&sender_queue),
            ConductorProxy::new(Arc::clone(&tasks)),
            Arc::clone(&context.system_counters),
            Arc::clone(&context.nano_clock),
            sender_clock,
            context.config.conductor_cycle_threshold_ns,
        );
        let receiver = Receiver::new(
            Arc::clone(&receiver_queue),
            ConductorProxy::new(Arc::clone(&tasks)),
            Arc::clone(&context.system_counters),
            Arc::clone(&context.nano_clock),
            receiver_clock,
            context.config.conductor_cycle_threshold_ns,
            context.config.pending_setups_timeout_ns,
        );
        let conductor = DriverConductor::new(
            context,
            SenderProxy::new(sender_queue),
            ReceiverProxy::new(receiver_queue),
            tasks,
            conductor_clock,
            Arc::clone(&terminate),
        )?;

        let mut agents = DriverAgents {
            conductor,
            sender,
            receiver,
        };

        info!(dir = %dir.display(), mode = ?threading_mode, "media driver launched");

        let mut threads = Vec::new();
        match threading_mode {
            ThreadingMode::Invoker => {
                return Ok(MediaDriver {
                    dir,
                    terminate,
                    threads,
                    agents: Some(agents),
                });
            }
            ThreadingMode::Shared => {
                let flag = Arc::clone(&terminate);
                threads.push(spawn_agent_thread("conduit-driver", move || {
                    run_agent_loop(flag, || agents.do_work());
                }));
            }
            ThreadingMode::SharedNetwork => {
                let DriverAgents {
                    mut conductor,
                    mut sender,
                    mut receiver,
                } = agents;
                let flag = Arc::clone(&terminate);
                threads.push(spawn_agent_thread("conduit-conductor", move || {
                    run_agent_loop(flag, || conductor.do_work());
                }));
                let flag = Arc::clone(&terminate);
                threads.push(spawn_agent_thread("conduit-network", move || {
                    run_agent_loop(flag, || sender.do_work() + receiver.do_work());
                }));
            }
            ThreadingMode::Dedicated => {
                let DriverAgents {
                    mut conductor,
                    mut sender,
                    mut receiver,
                } = agents;
                let flag = Arc::clone(&terminate);
                threads.push(spawn_agent_thread("conduit-conductor", move || {
                    run_agent_loop(flag, || conductor.do_work());
                }));
                let flag = Arc::clone(&terminate);
                threads.push(spawn_agent_thread("conduit-sender", move || {
                    run_agent_loop(flag, || sender.do_work());
                }));
                let flag = Arc::clone(&terminate);
                threads.push(spawn_agent_thread("conduit-receiver", move || {
                    run_agent_loop(flag, || receiver.do_work());
                }));
            }
        }

        Ok(MediaDriver {
            dir,
            terminate,
            threads,
            agents: None,
        })
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    /// `true` once a validated termination request (or `shutdown`) has been
    /// observed.
    pub fn is_terminated(&self) -> bool {
        self.terminate.load(Ordering::Acquire)
    }

    /// Invoker mode: run one duty cycle across all agents.
    ///
    /// Panics if the driver runs its own threads.
    pub fn do_work(&mut self) -> usize {
        self.agents
            .as_mut()
            .expect("do_work is only valid in invoker threading mode")
            .do_work()
    }

    /// Request shutdown and join the agent threads.
    pub fn shutdown(mut self) {
        self.terminate.store(true, Ordering::Release);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        info!(dir = %self.dir.display(), "media driver stopped");
    }
}

impl Drop for MediaDriver {
    fn drop(&mut self) {
        self.terminate.store(true, Ordering::Release);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

fn spawn_agent_thread(name: &str, body: impl FnOnce() + Send + 'static) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(name.to_owned())
        .spawn(body)
        .expect("failed to spawn agent thread")
}

fn run_agent_loop(terminate: Arc<AtomicBool>, mut do_work: impl FnMut() -> usize) {
    let strategy = IdleStrategy::backoff_default();
    let mut idle = strategy.new_state();
    while !terminate.load(Ordering::Acquire) {
        let work = do_work();
        idle.idle(&strategy, work);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &std::path::Path) -> DriverConfig {
        DriverConfig {
            dir: dir.to_path_buf(),
            threading_mode: ThreadingMode::Invoker,
            term_buffer_length: 64 * 1024,
            ipc_term_buffer_length: 64 * 1024,
            initial_window_length: 16 * 1024,
            ..DriverConfig::default()
        }
    }

    #[test]
    fn invoker_mode_drives_agents_inline() {
        let tmp = tempfile::tempdir().unwrap();
        let mut driver = MediaDriver::launch(test_config(&tmp.path().join("d"))).unwrap();
        for _ in 0..10 {
            driver.do_work();
        }
        assert!(!driver.is_terminated());
    }

    #[test]
    fn shared_mode_starts_and_stops() {
        let tmp = tempfile::tempdir().unwrap();
        let config = DriverConfig {
            threading_mode: ThreadingMode::Shared,
            ..test_config(&tmp.path().join("d"))
        };
        let driver = MediaDriver::launch(config).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));
        driver.shutdown();
    }
}
