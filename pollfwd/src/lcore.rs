//! # Execution Lanes
//!
//! ## Purpose
//!
//! A lane is a thread pinned to one CPU that runs routines on request. The first CPU of
//! the list is the main lane, which is the thread that created the `Lcores`; every other
//! CPU gets a worker thread that sleeps until a routine is launched on it.
//!
//! ## How it works
//!
//! Each worker owns a mailbox (a `crossbeam` channel). `remote_launch` drops a boxed
//! routine into it and returns at once; the worker runs the routine with its own lane
//! id, records the return value and goes back to waiting. `wait_lane` blocks until that
//! return value is available and puts the lane back into `Wait`.
//!
//! Lane state is `Wait -> Running -> Finished -> Wait`. A lane only accepts a new routine
//! in `Wait`, so a result has to be collected before the lane can be reused.
//!
//! Threads are pinned with `sched_setaffinity`. A failure to pin is logged and the lane
//! keeps running unpinned. The lane a thread belongs to is kept in a thread local and
//! read back with `current()`.
//!
//! ## Main components
//!
//! - `Lcores`: `new`, `remote_launch`, `launch_on_current`, `wait_lane`, `wait_all`.
//! - `LcoreId`, `LaneState`, `current()`.

use crate::numa;
use crossbeam::channel::{self, Receiver, Sender};
use std::cell::Cell;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread::{self, JoinHandle};

/// Lane id, equal to the CPU the lane is pinned to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LcoreId(pub u32);

impl fmt::Display for LcoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LaneState {
    Wait,
    Running,
    Finished,
}

impl LaneState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => LaneState::Running,
            2 => LaneState::Finished,
            _ => LaneState::Wait,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    Main,
    Worker,
}

/// Static facts about a lane.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LaneInfo {
    pub id: LcoreId,
    pub cpu: usize,
    pub socket_id: i32,
    pub role: Role,
}

type Routine = Box<dyn FnOnce(LcoreId) -> i32 + Send + 'static>;

thread_local! {
    static CURRENT: Cell<Option<LcoreId>> = const { Cell::new(None) };
}

/// Lane of the calling thread, `None` outside of any lane.
pub fn current() -> Option<LcoreId> {
    CURRENT.with(Cell::get)
}

struct Worker {
    info: LaneInfo,
    state: Arc<AtomicU8>,
    mailbox: Option<Sender<Routine>>,
    done: Receiver<i32>,
    thread: Option<JoinHandle<()>>,
}

/// The set of execution lanes.
pub struct Lcores {
    main: LaneInfo,
    workers: Vec<Worker>,
}

fn pin_to_cpu(cpu: usize) -> io::Result<()> {
    if cpu >= libc::CPU_SETSIZE as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("cpu {cpu} out of range"),
        ));
    }
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        if libc::sched_setaffinity(0, size_of::<libc::cpu_set_t>(), &set) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn enter_lane(info: &LaneInfo) {
    if let Err(e) = pin_to_cpu(info.cpu) {
        log::warn!("lane {} runs unpinned, cannot pin to cpu {}: {e}", info.id, info.cpu);
    }
    CURRENT.with(|c| c.set(Some(info.id)));
}

fn lane_info(cpu: usize, role: Role) -> io::Result<LaneInfo> {
    let id = u32::try_from(cpu).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("cpu {cpu} out of range"))
    })?;
    Ok(LaneInfo {
        id: LcoreId(id),
        cpu,
        socket_id: numa::cpu_socket_id(cpu),
        role,
    })
}

impl Lcores {
    /// Sets up one lane per CPU in `cpus`. The calling thread becomes the main lane on
    /// `cpus[0]`.
    pub fn new(cpus: &[usize]) -> io::Result<Self> {
        let Some((&main_cpu, worker_cpus)) = cpus.split_first() else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "at least one lane is required",
            ));
        };
        let main = lane_info(main_cpu, Role::Main)?;
        enter_lane(&main);

        let mut workers = Vec::with_capacity(worker_cpus.len());
        for &cpu in worker_cpus {
            let info = lane_info(cpu, Role::Worker)?;
            if info.id == main.id || workers.iter().any(|w: &Worker| w.info.id == info.id) {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("cpu {cpu} listed twice"),
                ));
            }
            workers.push(Self::spawn(info)?);
        }
        log::debug!(
            "{} lanes, main lane {} on socket {}",
            workers.len() + 1,
            main.id,
            main.socket_id
        );
        Ok(Lcores { main, workers })
    }

    fn spawn(info: LaneInfo) -> io::Result<Worker> {
        let (mailbox, inbox) = channel::bounded::<Routine>(1);
        let (done_tx, done) = channel::bounded::<i32>(1);
        let state = Arc::new(AtomicU8::new(LaneState::Wait as u8));
        let lane_state = state.clone();
        let thread = thread::Builder::new()
            .name(format!("lcore-{}", info.id))
            .spawn(move || {
                enter_lane(&info);
                for routine in inbox {
                    let ret = panic::catch_unwind(AssertUnwindSafe(|| routine(info.id)))
                        .unwrap_or_else(|_| {
                            log::error!("routine on lane {} panicked", info.id);
                            -1
                        });
                    lane_state.store(LaneState::Finished as u8, Ordering::Release);
                    if done_tx.send(ret).is_err() {
                        break;
                    }
                }
            })?;
        Ok(Worker {
            info,
            state,
            mailbox: Some(mailbox),
            done,
            thread: Some(thread),
        })
    }

    /// Number of lanes, main lane included.
    pub fn count(&self) -> usize {
        self.workers.len() + 1
    }

    pub fn main(&self) -> LcoreId {
        self.main.id
    }

    pub fn main_info(&self) -> &LaneInfo {
        &self.main
    }

    /// Worker lane ids in CPU list order.
    pub fn workers(&self) -> impl Iterator<Item = LcoreId> + '_ {
        self.workers.iter().map(|w| w.info.id)
    }

    pub fn info(&self, lane: LcoreId) -> Option<&LaneInfo> {
        if lane == self.main.id {
            return Some(&self.main);
        }
        self.worker(lane).map(|w| &w.info)
    }

    /// State of a worker lane. The main lane always reports `Wait` between launches.
    pub fn state(&self, lane: LcoreId) -> Option<LaneState> {
        if lane == self.main.id {
            return Some(LaneState::Wait);
        }
        self.worker(lane)
            .map(|w| LaneState::from_u8(w.state.load(Ordering::Acquire)))
    }

    fn worker(&self, lane: LcoreId) -> Option<&Worker> {
        self.workers.iter().find(|w| w.info.id == lane)
    }

    fn worker_or_err(&self, lane: LcoreId) -> io::Result<&Worker> {
        if lane == self.main.id {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("lane {lane} is the main lane"),
            ));
        }
        self.worker(lane).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("no lane {lane}"))
        })
    }

    /// Starts `routine` on a worker lane and returns without waiting for it.
    ///
    /// # Errors
    /// `InvalidInput` for the main lane or an unknown lane, `ResourceBusy` when the lane
    /// has not been waited on since its last launch.
    pub fn remote_launch<F>(&self, lane: LcoreId, routine: F) -> io::Result<()>
    where
        F: FnOnce(LcoreId) -> i32 + Send + 'static,
    {
        let worker = self.worker_or_err(lane)?;
        if worker
            .state
            .compare_exchange(
                LaneState::Wait as u8,
                LaneState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(io::Error::new(
                io::ErrorKind::ResourceBusy,
                format!("lane {lane} is busy"),
            ));
        }
        let sent = worker
            .mailbox
            .as_ref()
            .map(|mailbox| mailbox.send(Box::new(routine)).is_ok())
            .unwrap_or(false);
        if !sent {
            worker.state.store(LaneState::Wait as u8, Ordering::Release);
            return Err(io::Error::other(format!("lane {lane} has terminated")));
        }
        Ok(())
    }

    /// Runs `routine` on the calling thread as the main lane.
    pub fn launch_on_current<F>(&self, routine: F) -> i32
    where
        F: FnOnce(LcoreId) -> i32,
    {
        routine(self.main.id)
    }

    /// Blocks until the routine launched on `lane` returns, and returns its value.
    /// A lane with nothing launched returns 0 right away.
    pub fn wait_lane(&self, lane: LcoreId) -> io::Result<i32> {
        let worker = self.worker_or_err(lane)?;
        if LaneState::from_u8(worker.state.load(Ordering::Acquire)) == LaneState::Wait {
            return Ok(0);
        }
        let ret = worker
            .done
            .recv()
            .map_err(|_| io::Error::other(format!("lane {lane} has terminated")))?;
        worker.state.store(LaneState::Wait as u8, Ordering::Release);
        Ok(ret)
    }

    /// Waits for every worker lane that has a routine launched.
    pub fn wait_all(&self) -> Vec<(LcoreId, i32)> {
        let mut results = Vec::new();
        for worker in &self.workers {
            if LaneState::from_u8(worker.state.load(Ordering::Acquire)) == LaneState::Wait {
                continue;
            }
            match self.wait_lane(worker.info.id) {
                Ok(ret) => results.push((worker.info.id, ret)),
                Err(e) => log::error!("{e}"),
            }
        }
        results
    }
}

impl Drop for Lcores {
    fn drop(&mut self) {
        for worker in &mut self.workers {
            // closing the mailbox ends the worker loop once the current routine returns
            worker.mailbox.take();
        }
        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                if thread.join().is_err() {
                    log::error!("lane {} thread panicked", worker.info.id);
                }
            }
        }
        CURRENT.with(|c| {
            if c.get() == Some(self.main.id) {
                c.set(None);
            }
        });
    }
}

impl fmt::Debug for Lcores {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lcores")
            .field("main", &self.main)
            .field("workers", &self.workers.iter().map(|w| w.info).collect::<Vec<_>>())
            .finish()
    }
}

//
// ================================================================================================
//   UNITTESTS
// ================================================================================================
//
#[cfg(test)]
mod tests {
    use super::{LaneState, LcoreId, Lcores, current};
    use crossbeam::channel;
    use std::io;
    use std::time::Duration;

    #[test]
    fn test_empty_cpu_list_rejected() {
        assert_eq!(
            Lcores::new(&[]).unwrap_err().kind(),
            io::ErrorKind::InvalidInput
        );
        assert!(Lcores::new(&[0, 1, 1]).is_err());
    }

    #[test]
    fn test_main_lane_is_calling_thread() {
        let lanes = Lcores::new(&[0]).unwrap();
        assert_eq!(lanes.count(), 1);
        assert_eq!(current(), Some(LcoreId(0)));
        assert_eq!(lanes.launch_on_current(|id| id.0 as i32 + 7), 7);
        assert_eq!(
            lanes.remote_launch(LcoreId(0), |_| 0).unwrap_err().kind(),
            io::ErrorKind::InvalidInput
        );
        drop(lanes);
        assert_eq!(current(), None);
    }

    #[test]
    fn test_remote_launch_and_wait() {
        let lanes = Lcores::new(&[0, 1, 2]).unwrap();
        assert_eq!(lanes.workers().collect::<Vec<_>>(), vec![LcoreId(1), LcoreId(2)]);
        for lane in lanes.workers().collect::<Vec<_>>() {
            lanes
                .remote_launch(lane, |id| {
                    assert_eq!(current(), Some(id));
                    id.0 as i32 * 10
                })
                .unwrap();
        }
        let mut results = lanes.wait_all();
        results.sort();
        assert_eq!(results, vec![(LcoreId(1), 10), (LcoreId(2), 20)]);
        assert_eq!(lanes.state(LcoreId(1)), Some(LaneState::Wait));
        assert!(lanes.wait_all().is_empty());
    }

    #[test]
    fn test_busy_lane_rejects_launch() {
        let lanes = Lcores::new(&[0, 1]).unwrap();
        let (release, gate) = channel::bounded::<()>(0);
        lanes
            .remote_launch(LcoreId(1), move |_| {
                let _ = gate.recv_timeout(Duration::from_secs(10));
                3
            })
            .unwrap();
        assert_eq!(
            lanes.remote_launch(LcoreId(1), |_| 0).unwrap_err().kind(),
            io::ErrorKind::ResourceBusy
        );
        release.send(()).unwrap();
        assert_eq!(lanes.wait_lane(LcoreId(1)).unwrap(), 3);
        lanes.remote_launch(LcoreId(1), |_| 4).unwrap();
        assert_eq!(lanes.wait_lane(LcoreId(1)).unwrap(), 4);
    }

    #[test]
    fn test_finished_until_waited() {
        let lanes = Lcores::new(&[0, 1]).unwrap();
        lanes.remote_launch(LcoreId(1), |_| 1).unwrap();
        while lanes.state(LcoreId(1)) != Some(LaneState::Finished) {
            std::thread::yield_now();
        }
        assert!(lanes.remote_launch(LcoreId(1), |_| 0).is_err());
        assert_eq!(lanes.wait_lane(LcoreId(1)).unwrap(), 1);
    }

    #[test]
    fn test_panicking_routine_reports_failure() {
        let lanes = Lcores::new(&[0, 1]).unwrap();
        lanes.remote_launch(LcoreId(1), |_| panic!("boom")).unwrap();
        assert_eq!(lanes.wait_lane(LcoreId(1)).unwrap(), -1);
        assert!(lanes.wait_lane(LcoreId(5)).is_err());
    }
}
