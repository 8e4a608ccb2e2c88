//! Name resolution.
//!
//! Channel endpoints may name hosts that need DNS.  Resolution can block,
//! so the Conductor never resolves inline: requests go to a worker thread
//! and results come back through the intra-driver task queue each duty
//! cycle.  The resolver itself is pluggable; the default delegates to the
//! OS resolver.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::mpsc;
use std::sync::Arc;

use cn_concurrent::queues::TaskQueue;

/// Pluggable hostname resolution.
pub trait NameResolver: Send + Sync {
    /// Resolve `endpoint` of the form `host:port` to a socket address.
    fn resolve(&self, endpoint: &str) -> Option<SocketAddr>;
}

/// Resolves through the operating system.
#[derive(Default)]
pub struct DefaultNameResolver;

impl NameResolver for DefaultNameResolver {
    fn resolve(&self, endpoint: &str) -> Option<SocketAddr> {
        endpoint.to_socket_addrs().ok()?.next()
    }
}

/// A completed asynchronous resolution.
#[derive(Debug)]
pub struct ResolutionResult {
    pub correlation_id: i64,
    pub endpoint: String,
    pub address: Option<SocketAddr>,
}

struct ResolutionRequest {
    correlation_id: i64,
    endpoint: String,
}

/// Offloads blocking resolutions to a worker thread.
///
/// Results are posted to the supplied task queue; the Conductor drains it
/// each duty cycle and resumes the suspended command.
pub struct AsyncNameResolver {
    tx: mpsc::Sender<ResolutionRequest>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl AsyncNameResolver {
    pub fn new(
        resolver: Arc<dyn NameResolver>,
        results: Arc<TaskQueue<ResolutionResult>>,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<ResolutionRequest>();
        let handle = std::thread::Builder::new()
            .name("conduit-resolver".to_owned())
            .spawn(move || {
                while let Ok(request) = rx.recv() {
                    let address = resolver.resolve(&request.endpoint);
                    results.offer(ResolutionResult {
                        correlation_id: request.correlation_id,
                        endpoint: request.endpoint,
                        address,
                    });
                }
            })
            .expect("failed to spawn resolver thread");
        AsyncNameResolver {
            tx,
            handle: Some(handle),
        }
    }

    /// Queue a resolution; the result arrives on the task queue.
    pub fn resolve(&self, correlation_id: i64, endpoint: &str) {
        let _ = self.tx.send(ResolutionRequest {
            correlation_id,
            endpoint: endpoint.to_owned(),
        });
    }
}

impl Drop for AsyncNameResolver {
    fn drop(&mut self) {
        // Closing the channel stops the worker loop.
        let (tx, _) = mpsc::channel();
        drop(std::mem::replace(&mut self.tx, tx));
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_resolver_handles_literal_addresses() {
        let resolver = DefaultNameResolver;
        let addr = resolver.resolve("127.0.0.1:40123").unwrap();
        assert_eq!(addr.port(), 40123);
        assert!(addr.ip().is_loopback());
    }

    #[test]
    fn default_resolver_handles_localhost() {
        let resolver = DefaultNameResolver;
        assert!(resolver.resolve("localhost:9000").is_some());
    }

    #[test]
    fn async_resolution_posts_result_to_queue() {
        let results = Arc::new(TaskQueue::new());
        let resolver = AsyncNameResolver::new(Arc::new(DefaultNameResolver), Arc::clone(&results));

        resolver.resolve(42, "127.0.0.1:7777");

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            if let Some(result) = results.poll() {
                assert_eq!(result.correlation_id, 42);
                assert!(result.address.is_some());
                break;
            }
            assert!(std::time::Instant::now() < deadline, "resolution never arrived");
            std::thread::yield_now();
        }
    }

    #[test]
    fn unresolvable_name_yields_none() {
        let results = Arc::new(TaskQueue::new());
        let resolver = AsyncNameResolver::new(Arc::new(DefaultNameResolver), Arc::clone(&results));
        resolver.resolve(7, "definitely-not-a-real-host.invalid:1");

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        loop {
            if let Some(result) = results.poll() {
                assert_eq!(result.address, None);
                break;
            }
            assert!(std::time::Instant::now() < deadline);
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }
}
