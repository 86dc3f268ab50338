//! Built-in scripted programs for the common concurrency patterns.
//!
//! Each function returns a [`Program`] whose script 0 spawns the workers
//! and joins them. Resource ids are small constants so traces stay
//! readable.

use std::fmt;
use std::str::FromStr;

use crate::error::SchedError;
use crate::model::{Program, Step};
use crate::types::ResourceId;

/// Mutex guarding the producer/consumer buffer.
pub const BUFFER_LOCK: ResourceId = ResourceId(0x100);
/// Signalled when the buffer gains an item.
pub const NOT_EMPTY: ResourceId = ResourceId(0x101);
/// Signalled when the buffer loses an item.
pub const NOT_FULL: ResourceId = ResourceId(0x102);
/// Barrier shared by the barrier workload.
pub const ROUND_BARRIER: ResourceId = ResourceId(0x200);

/// Fork `i` of the dining philosophers.
pub fn fork(i: usize) -> ResourceId {
    ResourceId(i as u64)
}

/// Spawn workers `1..=n` in order, then join them in order.
fn main_script(n: usize) -> Vec<Step> {
    (1..=n)
        .map(Step::Spawn)
        .chain((0..n).map(Step::Join))
        .collect()
}

/// `n` philosophers, each taking its left fork, then its right one.
///
/// Deadlocks when every philosopher holds its left fork.
pub fn dining_philosophers(n: usize) -> Program {
    let mut program = Program::new("dining").thread("main", main_script(n));
    for i in 0..n {
        let (left, right) = (fork(i), fork((i + 1) % n));
        program = program.thread(
            &format!("philosopher{i}"),
            vec![
                Step::Lock(left),
                Step::Lock(right),
                Step::Unlock(right),
                Step::Unlock(left),
            ],
        );
    }
    program
}

/// One producer and one consumer exchanging `items` through a
/// single-slot buffer. Counter 0 is the number of items in the buffer.
pub fn producer_consumer(items: usize) -> Program {
    const FULL: usize = 0;
    let producer = (0..items).flat_map(|_| {
        [
            Step::Lock(BUFFER_LOCK),
            Step::Wait {
                cond: NOT_FULL,
                mutex: BUFFER_LOCK,
                var: FULL,
                while_eq: 1,
            },
            Step::Add(FULL, 1),
            Step::Signal(NOT_EMPTY),
            Step::Unlock(BUFFER_LOCK),
        ]
    });
    let consumer = (0..items).flat_map(|_| {
        [
            Step::Lock(BUFFER_LOCK),
            Step::Wait {
                cond: NOT_EMPTY,
                mutex: BUFFER_LOCK,
                var: FULL,
                while_eq: 0,
            },
            Step::Add(FULL, -1),
            Step::Signal(NOT_FULL),
            Step::Unlock(BUFFER_LOCK),
        ]
    });
    Program::new("prodcons")
        .thread("main", main_script(2))
        .thread("producer", producer.collect())
        .thread("consumer", consumer.collect())
}

/// `threads` workers incrementing a shared counter without a lock.
pub fn racy_counter(threads: usize) -> Program {
    let mut program = Program::new("counter").thread("main", main_script(threads));
    for i in 0..threads {
        program = program.thread(
            &format!("worker{i}"),
            vec![Step::Add(0, 1), Step::Yield, Step::Add(0, 1)],
        );
    }
    program
}

/// `threads` workers doing two rounds of work separated by a barrier.
pub fn barrier_rounds(threads: usize) -> Program {
    let mut program = Program::new("barrier").thread("main", main_script(threads));
    for i in 0..threads {
        program = program.thread(
            &format!("worker{i}"),
            vec![
                Step::Add(0, 1),
                Step::Barrier(ROUND_BARRIER, threads),
                Step::Add(1, 1),
            ],
        );
    }
    program
}

/// Workloads selectable by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Workload {
    Dining,
    ProdCons,
    Counter,
    Barrier,
}

impl Workload {
    /// Build the program. `size` is the philosopher, worker or item count.
    pub fn program(self, size: usize) -> Program {
        match self {
            Workload::Dining => dining_philosophers(size),
            Workload::ProdCons => producer_consumer(size),
            Workload::Counter => racy_counter(size),
            Workload::Barrier => barrier_rounds(size),
        }
    }
}

impl FromStr for Workload {
    type Err = SchedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dining" => Ok(Workload::Dining),
            "prodcons" => Ok(Workload::ProdCons),
            "counter" => Ok(Workload::Counter),
            "barrier" => Ok(Workload::Barrier),
            _ => Err(SchedError::Config(format!(
                "unknown workload '{s}' (expected dining, prodcons, counter or barrier)"
            ))),
        }
    }
}

impl fmt::Display for Workload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Workload::Dining => "dining",
            Workload::ProdCons => "prodcons",
            Workload::Counter => "counter",
            Workload::Barrier => "barrier",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workloads_validate() {
        for w in [
            Workload::Dining,
            Workload::ProdCons,
            Workload::Counter,
            Workload::Barrier,
        ] {
            let p = w.program(3);
            p.validate().unwrap();
            assert_eq!(w.to_string().parse::<Workload>().unwrap(), w);
        }
    }

    #[test]
    fn test_dining_forks_wrap_around() {
        let p = dining_philosophers(2);
        assert_eq!(p.scripts().len(), 3);
        assert_eq!(p.scripts()[2].steps[0], Step::Lock(fork(1)));
        assert_eq!(p.scripts()[2].steps[1], Step::Lock(fork(0)));
    }
}
