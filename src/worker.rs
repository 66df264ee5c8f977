//! The background worker and its end of the channels.

use crate::arena::{Allocators, Arena};
use crate::channel::Channel;
use crate::env::{Environment, Resolve};
use crate::error::{ChannelError, ContextError, Result};
use crate::query::{Answer, Query};
use crate::wire::{Request, Response};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Worker side of the transport: reads requests, writes results.
///
/// Dropping the link closes the result channel, which callers observe as
/// end-of-stream, and the request channel's read end, so later submissions
/// fail with a broken pipe instead of blocking.
#[derive(Debug)]
pub struct WorkerLink {
    requests: Arc<Channel>,
    results: Arc<Channel>,
}

impl WorkerLink {
    pub(crate) const fn new(requests: Arc<Channel>, results: Arc<Channel>) -> Self {
        Self { requests, results }
    }

    /// Blocks for the next request.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Closed`] once the context shuts down, or a protocol
    /// error for a malformed frame.
    pub fn next_request(&self) -> std::result::Result<Request, ChannelError> {
        let frame = self.requests.recv()?;
        Request::decode(&frame).map_err(|e| match Response::peek_id(&frame) {
            Ok(id) => ChannelError::Protocol(format!("request {id}: {e}")),
            Err(_) => e,
        })
    }

    /// Sends the answer for one request.
    ///
    /// # Errors
    ///
    /// Returns the channel error if the result channel is broken.
    pub fn send_result(&self, response: &Response) -> std::result::Result<(), ChannelError> {
        self.results.send(&response.encode())
    }

    /// Sends a raw payload on the result channel, framed but not encoded.
    ///
    /// # Errors
    ///
    /// Returns the channel error if the result channel is broken.
    pub fn send_frame(&self, payload: &[u8]) -> std::result::Result<(), ChannelError> {
        self.results.send(payload)
    }
}

impl Drop for WorkerLink {
    fn drop(&mut self) {
        self.results.close_writer();
        self.requests.close_reader();
    }
}

/// A worker serving one context until its request channel closes.
pub(crate) struct Worker {
    pub num: u32,
    pub link: WorkerLink,
    pub env: Arc<Environment>,
    pub resolver: Arc<dyn Resolve>,
    pub allocators: Arc<Mutex<Allocators>>,
}

impl Worker {
    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("resolver-worker-{}", self.num))
            .spawn(move || self.run())
    }

    fn run(self) {
        let (frames, queued) = crossbeam_channel::unbounded();
        let relay = match self.spawn_relay(queued) {
            Ok(relay) => relay,
            Err(e) => {
                tracing::warn!(worker = self.num, error = %e, "Cannot start result relay");
                return;
            }
        };

        let mut arena = self.allocators.lock().acquire(self.num);
        tracing::info!(worker = self.num, "Resolver worker started");

        let served = self.serve(&mut arena, &frames);
        drop(frames);
        if relay.join().is_err() {
            tracing::warn!(worker = self.num, "Result relay panicked");
        }

        self.allocators.lock().release(arena);
        tracing::info!(worker = self.num, served, "Resolver worker stopped");
    }

    /// Moves encoded results from the queue onto the result channel.
    ///
    /// The worker only ever pushes to the unbounded queue, so it keeps
    /// draining requests while nobody reads results.
    fn spawn_relay(&self, queued: Receiver<Vec<u8>>) -> io::Result<JoinHandle<()>> {
        let results = Arc::clone(&self.link.results);
        let num = self.num;
        thread::Builder::new()
            .name(format!("resolver-relay-{num}"))
            .spawn(move || {
                for frame in queued {
                    if let Err(e) = results.send(&frame) {
                        tracing::warn!(worker = num, error = %e, "Result channel failed");
                        return;
                    }
                }
            })
    }

    fn serve(&self, arena: &mut Arena, frames: &Sender<Vec<u8>>) -> usize {
        let mut served = 0;
        loop {
            let request = match self.link.next_request() {
                Ok(request) => request,
                Err(ChannelError::Closed) => return served,
                Err(ChannelError::Protocol(msg)) => {
                    tracing::warn!(worker = self.num, error = %msg, "Dropping malformed request");
                    continue;
                }
                Err(ChannelError::Io(e)) => {
                    tracing::warn!(worker = self.num, error = %e, "Request channel failed");
                    return served;
                }
            };

            arena.reset();
            let outcome = self.answer(&request.query, arena);
            tracing::debug!(
                worker = self.num,
                query_id = %request.id,
                query = %request.query,
                ok = outcome.is_ok(),
                "Resolved query"
            );

            let response = Response {
                id: request.id,
                outcome,
            };
            if frames.send(response.encode()).is_err() {
                tracing::warn!(worker = self.num, "Result relay stopped");
                return served;
            }
            served += 1;
        }
    }

    fn answer(&self, query: &Query, arena: &mut Arena) -> Result<Answer> {
        if let Some(answer) = self.env.local_zones.lookup(query) {
            return Ok(answer);
        }
        self.resolver
            .resolve(query, &self.env.env, arena)
            .map_err(|e| match e {
                ContextError::Transport(inner) => ContextError::ResolutionFailed(inner.to_string()),
                other => other,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::SuperAllocator;
    use crate::config::{ContextConfig, LocalData};
    use crate::query::{RecordClass, RecordType};
    use crate::registry::QueryId;

    fn harness(
        resolver: Arc<dyn Resolve>,
        config: &ContextConfig,
    ) -> (Arc<Channel>, Arc<Channel>, Arc<Mutex<Allocators>>, JoinHandle<()>) {
        let requests = Arc::new(Channel::new(4096).unwrap());
        let results = Arc::new(Channel::new(4096).unwrap());
        let allocators = Arc::new(Mutex::new(Allocators::default()));
        let env = Environment::build(config, &mut SuperAllocator::new()).unwrap();
        let handle = Worker {
            num: 7,
            link: WorkerLink::new(Arc::clone(&requests), Arc::clone(&results)),
            env: Arc::new(env),
            resolver,
            allocators: Arc::clone(&allocators),
        }
        .spawn()
        .unwrap();
        (requests, results, allocators, handle)
    }

    fn request(id: u32, name: &str) -> Vec<u8> {
        Request {
            id: QueryId(id),
            query: Query::new(name, RecordType::A, RecordClass::IN).unwrap(),
        }
        .encode()
    }

    #[test]
    fn answers_in_order_and_recycles_arena() {
        let resolver = Arc::new(|q: &Query| -> Result<Answer> {
            if q.name() == "fail.test" {
                Err(ContextError::ResolutionFailed("SERVFAIL".into()))
            } else {
                Ok(Answer::for_query(q).with_data([1, 2, 3, 4]))
            }
        });
        let (requests, results, allocators, handle) =
            harness(resolver, &ContextConfig::new());

        requests.send(&request(1, "ok.test")).unwrap();
        requests.send(&request(2, "fail.test")).unwrap();

        let first = Response::decode(&results.recv().unwrap()).unwrap();
        assert_eq!(first.id, QueryId(1));
        assert_eq!(first.outcome.unwrap().data, vec![vec![1, 2, 3, 4]]);

        let second = Response::decode(&results.recv().unwrap()).unwrap();
        assert_eq!(second.id, QueryId(2));
        assert!(matches!(second.outcome, Err(ContextError::ResolutionFailed(_))));

        requests.close_writer();
        handle.join().unwrap();
        assert!(matches!(results.recv(), Err(ChannelError::Closed)));
        assert_eq!(allocators.lock().pool.len(), 1);
    }

    #[test]
    fn local_data_wins_over_resolver() {
        let resolver = Arc::new(|_: &Query| -> Result<Answer> {
            Err(ContextError::ResolutionFailed("should not be asked".into()))
        });
        let config = ContextConfig::new().with_local_data(LocalData {
            name: "printer.lan".into(),
            rtype: RecordType::A,
            class: RecordClass::IN,
            rdata: vec![10, 0, 0, 9],
        });
        let (requests, results, _, handle) = harness(resolver, &config);

        requests.send(&request(5, "printer.lan")).unwrap();
        let resp = Response::decode(&results.recv().unwrap()).unwrap();
        assert_eq!(resp.outcome.unwrap().data, vec![vec![10, 0, 0, 9]]);

        requests.close_writer();
        handle.join().unwrap();
    }

    #[test]
    fn keeps_reading_requests_while_results_pile_up() {
        let resolver = Arc::new(|q: &Query| -> Result<Answer> { Ok(Answer::for_query(q)) });
        let (requests, results, _, handle) = harness(resolver, &ContextConfig::new());

        // Far more than both pipes can buffer; nobody reads results yet.
        for id in 1..=20_000 {
            requests.send(&request(id, "backlog.test")).unwrap();
        }
        requests.close_writer();

        let mut next = 1;
        while let Ok(frame) = results.recv() {
            assert_eq!(Response::decode(&frame).unwrap().id, QueryId(next));
            next += 1;
        }
        assert_eq!(next, 20_001);
        handle.join().unwrap();
    }

    #[test]
    fn next_worker_reuses_parked_arena() {
        let allocators = Arc::new(Mutex::new(Allocators::default()));
        for num in 0..2 {
            let requests = Arc::new(Channel::new(4096).unwrap());
            let results = Arc::new(Channel::new(4096).unwrap());
            let env =
                Environment::build(&ContextConfig::new(), &mut SuperAllocator::new()).unwrap();
            let resolver = Arc::new(|q: &Query| -> Result<Answer> { Ok(Answer::for_query(q)) });
            let handle = Worker {
                num,
                link: WorkerLink::new(Arc::clone(&requests), Arc::clone(&results)),
                env: Arc::new(env),
                resolver,
                allocators: Arc::clone(&allocators),
            }
            .spawn()
            .unwrap();
            requests.send(&request(1, "reuse.test")).unwrap();
            results.recv().unwrap();
            requests.close_writer();
            handle.join().unwrap();
        }

        let allocators = allocators.lock();
        assert_eq!(allocators.root.arenas_carved(), 1);
        assert_eq!(allocators.pool.len(), 1);
    }

    #[test]
    fn malformed_request_is_skipped() {
        let resolver = Arc::new(|q: &Query| -> Result<Answer> { Ok(Answer::for_query(q)) });
        let (requests, results, _, handle) = harness(resolver, &ContextConfig::new());

        requests.send(&[0, 0, 0, 1, 0xff]).unwrap();
        requests.send(&request(2, "after.test")).unwrap();

        let resp = Response::decode(&results.recv().unwrap()).unwrap();
        assert_eq!(resp.id, QueryId(2));

        requests.close_writer();
        handle.join().unwrap();
    }
}
