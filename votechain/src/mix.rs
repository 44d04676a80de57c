//! Batching mixnet.
//!
//! Ballots are buffered and released in shuffled batches so the order they reach the chain says
//! nothing about the order they were cast in. A batch is released when the buffer reaches the
//! minimum batch size, when the oldest buffered ballot has waited `max_wait_secs`, or on demand.

use crate::*;
use rand::seq::SliceRandom;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct MixConfig {
    /// Ballots needed before a batch is released without waiting
    pub batch_size: usize,

    /// Longest a ballot may sit in the buffer
    pub max_wait_secs: u64,

    /// How often the timer checks the buffer
    pub tick_ms: u64,
}

impl Default for MixConfig {
    fn default() -> Self {
        MixConfig {
            batch_size: 5,
            max_wait_secs: 30,
            tick_ms: 1000,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MixState {
    Empty,
    Accumulating,
    Ready,
    Flushing,
}

#[derive(Default)]
struct MixBuffer {
    ballots: Vec<Ballot>,
    oldest: Option<Instant>,
    flushing: usize,
}

pub struct Mixnet {
    config: MixConfig,
    buffer: Mutex<MixBuffer>,
    output: UnboundedSender<Vec<Ballot>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl Mixnet {
    /// A mixnet and the receiving end of its shuffled batches
    pub fn new(config: MixConfig) -> (Self, UnboundedReceiver<Vec<Ballot>>) {
        let (output, receiver) = mpsc::unbounded_channel();
        let mixnet = Mixnet {
            config,
            buffer: Mutex::new(MixBuffer::default()),
            output,
            timer: Mutex::new(None),
        };
        (mixnet, receiver)
    }

    pub fn config(&self) -> &MixConfig {
        &self.config
    }

    fn lock(&self) -> Result<MutexGuard<MixBuffer>, Error> {
        self.buffer
            .lock()
            .map_err(|_| Error::Store("mixnet buffer lock poisoned".to_string()))
    }

    pub fn state(&self) -> MixState {
        match self.lock() {
            Ok(buffer) if buffer.flushing > 0 => MixState::Flushing,
            Ok(buffer) if buffer.ballots.is_empty() => MixState::Empty,
            Ok(buffer) if buffer.ballots.len() >= self.config.batch_size => MixState::Ready,
            Ok(_) => MixState::Accumulating,
            Err(_) => MixState::Empty,
        }
    }

    /// Number of buffered ballots
    pub fn len(&self) -> usize {
        self.lock().map(|buffer| buffer.ballots.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Buffer a ballot, releasing a batch if the buffer is full
    pub fn add_vote(&self, ballot: Ballot) -> Result<(), Error> {
        let ready = {
            let mut buffer = self.lock()?;
            if buffer.ballots.is_empty() {
                buffer.oldest = Some(Instant::now());
            }
            buffer.ballots.push(ballot);
            buffer.ballots.len() >= self.config.batch_size
        };

        if ready {
            self.flush()?;
        }
        Ok(())
    }

    /// Release whatever is buffered right away. Returns the number of ballots released.
    pub fn force_process_votes(&self) -> Result<usize, Error> {
        self.flush()
    }

    /// Whether the oldest buffered ballot has waited long enough
    fn is_overdue(&self) -> bool {
        let max_wait = Duration::from_secs(self.config.max_wait_secs);
        self.lock()
            .map(|buffer| {
                buffer
                    .oldest
                    .map(|oldest| oldest.elapsed() >= max_wait)
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }

    // Draining happens under the lock, so each ballot lands in exactly one batch.
    fn flush(&self) -> Result<usize, Error> {
        let mut batch = {
            let mut buffer = self.lock()?;
            if buffer.ballots.is_empty() {
                return Ok(0);
            }
            buffer.oldest = None;
            buffer.flushing += 1;
            std::mem::take(&mut buffer.ballots)
        };

        let mut rng = rand::rngs::OsRng {};
        batch.shuffle(&mut rng);
        let released = batch.len();
        let sent = self.output.send(batch);

        self.lock()?.flushing -= 1;

        match sent {
            Ok(()) => {
                log::info!("mixnet released a batch of {} ballots", released);
                Ok(released)
            }
            Err(mpsc::error::SendError(batch)) => {
                // nobody is listening; keep the ballots rather than drop them
                log::error!("mixnet output closed, keeping {} ballots", batch.len());
                let mut buffer = self.lock()?;
                buffer.ballots.extend(batch);
                buffer.oldest.get_or_insert_with(Instant::now);
                Err(Error::Store("mixnet output closed".to_string()))
            }
        }
    }

    /// Start the timer that releases partial batches after `max_wait_secs`.
    ///
    /// Must be called from within a tokio runtime. Calling it twice restarts the timer.
    pub fn start(self: &Arc<Self>) {
        let mixnet = Arc::downgrade(self);
        let tick = Duration::from_millis(self.config.tick_ms.max(1));
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                interval.tick().await;
                let mixnet = match mixnet.upgrade() {
                    Some(mixnet) => mixnet,
                    None => break,
                };
                if mixnet.is_overdue() {
                    if let Err(e) = mixnet.flush() {
                        log::error!("mixnet timer flush failed: {}", e);
                    }
                }
            }
        });

        if let Ok(mut timer) = self.timer.lock() {
            if let Some(previous) = timer.replace(handle) {
                previous.abort();
            }
        }
    }

    /// Stop the timer. Buffered ballots stay buffered.
    pub fn stop(&self) {
        if let Ok(mut timer) = self.timer.lock() {
            if let Some(handle) = timer.take() {
                handle.abort();
            }
        }
    }
}

impl Drop for Mixnet {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::TestElection;
    use std::collections::HashSet;

    fn config(batch_size: usize) -> MixConfig {
        MixConfig {
            batch_size,
            max_wait_secs: 3600,
            tick_ms: 10,
        }
    }

    #[test]
    fn releases_full_batches() {
        let election = TestElection::new(2, 5);
        let ballots: Vec<Ballot> = (0..5).map(|i| election.ballot(i, i % 2)).collect();
        let (mixnet, mut output) = Mixnet::new(config(3));
        assert_eq!(mixnet.state(), MixState::Empty);

        mixnet.add_vote(ballots[0].clone()).unwrap();
        mixnet.add_vote(ballots[1].clone()).unwrap();
        assert_eq!(mixnet.state(), MixState::Accumulating);
        assert!(output.try_recv().is_err());

        mixnet.add_vote(ballots[2].clone()).unwrap();
        assert_eq!(mixnet.state(), MixState::Empty);
        let batch = output.try_recv().unwrap();
        assert_eq!(batch.len(), 3);
        let ids: HashSet<_> = batch.iter().map(|b| b.id).collect();
        assert_eq!(ids, ballots[..3].iter().map(|b| b.id).collect::<HashSet<_>>());

        mixnet.add_vote(ballots[3].clone()).unwrap();
        assert_eq!(mixnet.force_process_votes().unwrap(), 1);
        assert_eq!(output.try_recv().unwrap(), vec![ballots[3].clone()]);
        assert_eq!(mixnet.force_process_votes().unwrap(), 0);
    }

    #[test]
    fn closed_output_keeps_ballots() {
        let election = TestElection::new(2, 2);
        let (mixnet, output) = Mixnet::new(config(10));
        drop(output);

        mixnet.add_vote(election.ballot(0, 0)).unwrap();
        assert!(mixnet.force_process_votes().is_err());
        assert_eq!(mixnet.len(), 1);
    }

    #[test]
    fn concurrent_adds_are_counted_once() {
        let election = TestElection::new(2, 8);
        let ballots: Vec<Ballot> = (0..8).map(|i| election.ballot(i, 0)).collect();
        let (mixnet, mut output) = Mixnet::new(config(3));
        let mixnet = Arc::new(mixnet);

        let handles: Vec<_> = ballots
            .iter()
            .cloned()
            .map(|ballot| {
                let mixnet = mixnet.clone();
                std::thread::spawn(move || mixnet.add_vote(ballot).unwrap())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        mixnet.force_process_votes().unwrap();

        let mut seen = Vec::new();
        while let Ok(batch) = output.try_recv() {
            seen.extend(batch.into_iter().map(|b| b.id));
        }
        seen.sort();
        let mut expected: Vec<_> = ballots.iter().map(|b| b.id).collect();
        expected.sort();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn timer_flushes_partial_batches() {
        let election = TestElection::new(2, 2);
        let (mixnet, mut output) = Mixnet::new(MixConfig {
            batch_size: 10,
            max_wait_secs: 0,
            tick_ms: 10,
        });
        let mixnet = Arc::new(mixnet);
        mixnet.start();

        mixnet.add_vote(election.ballot(0, 1)).unwrap();
        let batch = tokio::time::timeout(Duration::from_secs(5), output.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.len(), 1);

        mixnet.stop();
    }
}
