//! The barrier every participant of a stop-the-world pause passes three
//! times.

use parking_lot::{Condvar, Mutex};

/// Where in a pause the participants wait for each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Every participant has submitted its roots and parked; the
    /// coordinator may start collecting.
    RootsSubmitted,
    /// The coordinator has finished the collection. Root slots have been
    /// repointed and may be read again.
    Collected,
    /// The coordinator has ended the cycle in the GC state, so leaving
    /// cannot race with a new request or with a mutator deregistering.
    Released,
}

#[derive(Debug, Default)]
struct Round {
    arrived: usize,
    /// Bumped by the last arrival of every round.
    generation: u64,
    phase: Option<Phase>,
}

/// Blocks participants until all of them reached the same [`Phase`].
#[derive(Debug, Default)]
pub struct PauseBarrier {
    round: Mutex<Round>,
    passed: Condvar,
}

impl PauseBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until `participants` threads, this one included, arrived at
    /// `phase`.
    pub fn wait(&self, phase: Phase, participants: usize) {
        debug_assert!(participants > 0);
        let mut round = self.round.lock();
        debug_assert!(
            round.arrived == 0 || round.phase == Some(phase),
            "pause participants disagree on the phase: {:?} vs {phase:?}",
            round.phase
        );
        round.phase = Some(phase);
        round.arrived += 1;

        if round.arrived == participants {
            round.arrived = 0;
            round.generation = round.generation.wrapping_add(1);
            self.passed.notify_all();
            return;
        }
        let generation = round.generation;
        while round.generation == generation {
            self.passed.wait(&mut round);
        }
    }

    /// Rounds completed so far.
    pub fn generation(&self) -> u64 {
        self.round.lock().generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn single_participant_passes_every_phase() {
        let barrier = PauseBarrier::new();
        for phase in [Phase::RootsSubmitted, Phase::Collected, Phase::Released] {
            barrier.wait(phase, 1);
        }
        assert_eq!(barrier.generation(), 3);
    }

    #[test]
    fn coordinator_work_is_visible_after_collected() {
        let threads = 4;
        let pauses = 50;
        let barrier = Arc::new(PauseBarrier::new());
        let submitted = Arc::new(AtomicUsize::new(0));
        let collected = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let barrier = barrier.clone();
                let submitted = submitted.clone();
                let collected = collected.clone();
                std::thread::spawn(move || {
                    for pause in 0..pauses {
                        submitted.fetch_add(1, Ordering::SeqCst);
                        barrier.wait(Phase::RootsSubmitted, threads);
                        assert_eq!(submitted.load(Ordering::SeqCst), (pause + 1) * threads);
                        if t == 0 {
                            collected.fetch_add(1, Ordering::SeqCst);
                        }
                        barrier.wait(Phase::Collected, threads);
                        assert_eq!(collected.load(Ordering::SeqCst), pause + 1);
                        barrier.wait(Phase::Released, threads);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().expect("thread panicked");
        }
        assert_eq!(barrier.generation(), 3 * pauses as u64);
    }
}
