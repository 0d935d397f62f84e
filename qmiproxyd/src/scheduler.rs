// src/scheduler.rs

//! Persisted table of delayed actions and the 1 Hz thread that fires them.
//!
//! The table is a fixed array of slots written out as flat records after
//! every change, so pending tasks survive a restart. Firing a task never does
//! I/O on the modem transports directly: it sends a [`Job`] to the proxy loop,
//! which owns them and reports back through [`TaskTable::finish`].

use anyhow::Result;
use chrono::{DateTime, Days, Local, NaiveTime, TimeZone};
use log::{debug, error, info, warn};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::constants::{MAX_TASK_ARG, MAX_TASKS, SWEEP_EVERY_TICKS};
use crate::error::ProxyError;

/// Index of a slot in the task table.
pub type TaskId = usize;

#[derive(Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive, Copy, Clone)]
#[repr(u8)]
pub enum TaskType {
    Sms = 0,
    Call = 1,
    WakeHost = 2,
    ClearDoNotDisturb = 3,
}

#[derive(Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive, Copy, Clone)]
#[repr(u8)]
pub enum TaskStatus {
    Free = 0,
    Pending = 1,
    InProgress = 2,
    Done = 3,
    Failed = 4,
}

#[derive(Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive, Copy, Clone)]
#[repr(u8)]
pub enum TaskMode {
    /// Fire at the next occurrence of a wall-clock time.
    AtTime = 0,
    /// Fire after a delay.
    Countdown = 1,
}

/// Work handed from the scheduler (or the chat interpreter) to the proxy loop.
#[derive(Debug, Eq, PartialEq, Clone)]
pub enum Command {
    InjectSms(String),
    StartCall,
    WakeHost(Duration),
    SetDoNotDisturb(bool),
}

/// A due task on its way to the proxy loop.
#[derive(Debug, Eq, PartialEq, Clone)]
pub struct Job {
    pub task: TaskId,
    pub command: Command,
}

/// What a caller asks for; the table fills in status and execution time.
#[derive(Debug, Eq, PartialEq, Clone)]
pub struct TaskRequest {
    pub kind: TaskType,
    pub param: i32,
    pub mode: TaskMode,
    pub hour: u8,
    pub minute: u8,
    pub arg: String,
}

#[derive(Debug, Eq, PartialEq, Clone)]
pub struct Task {
    pub kind: TaskType,
    pub param: i32,
    pub status: TaskStatus,
    pub mode: TaskMode,
    pub hour: u8,
    pub minute: u8,
    pub exec_time: i64,
    pub arg: String,
}

impl Task {
    fn free() -> Self {
        Self {
            kind: TaskType::Sms,
            param: 0,
            status: TaskStatus::Free,
            mode: TaskMode::Countdown,
            hour: 0,
            minute: 0,
            exec_time: 0,
            arg: String::new(),
        }
    }

    /// The command that carries out this task.
    pub fn command(&self) -> Command {
        match self.kind {
            TaskType::Sms => Command::InjectSms(self.arg.clone()),
            TaskType::Call => Command::StartCall,
            TaskType::WakeHost => Command::WakeHost(Duration::from_secs(u64::from(self.param.unsigned_abs()))),
            TaskType::ClearDoNotDisturb => Command::SetDoNotDisturb(false),
        }
    }
}

/// Absolute execution time for a request made at `now`.
///
/// At-Time picks today's `hh:mm` if it is still ahead, otherwise tomorrow's.
/// Countdown adds `hh` hours and `mm` minutes.
pub fn compute_exec_time<Tz: TimeZone>(mode: TaskMode, hour: u8, minute: u8, now: &DateTime<Tz>) -> i64 {
    match mode {
        TaskMode::Countdown => now.timestamp() + i64::from(hour) * 3600 + i64::from(minute) * 60,
        TaskMode::AtTime => {
            let Some(at) = NaiveTime::from_hms_opt(u32::from(hour) % 24, u32::from(minute) % 60, 0) else {
                return now.timestamp();
            };
            let today = now.date_naive();
            let candidate = |date: chrono::NaiveDate| {
                now.timezone()
                    .from_local_datetime(&date.and_time(at))
                    .earliest()
                    .map(|dt| dt.timestamp())
            };
            match candidate(today) {
                Some(ts) if ts > now.timestamp() => ts,
                _ => today
                    .checked_add_days(Days::new(1))
                    .and_then(candidate)
                    .unwrap_or_else(|| now.timestamp() + 86_400),
            }
        }
    }
}

// --- Flat Record Layout ---
//
//   kind u8 | status u8 | mode u8 | hour u8 | minute u8 | arg_len u8 | pad [2]
//   param i32 LE | exec_time i64 LE | arg [160]

const RECORD_LEN: usize = 8 + 4 + 8 + MAX_TASK_ARG;

fn encode_record(task: &Task, out: &mut Vec<u8>) {
    let arg = task.arg.as_bytes();
    let arg_len = arg.len().min(MAX_TASK_ARG);
    out.extend_from_slice(&[
        task.kind.into(),
        task.status.into(),
        task.mode.into(),
        task.hour,
        task.minute,
        arg_len as u8,
        0,
        0,
    ]);
    out.extend_from_slice(&task.param.to_le_bytes());
    out.extend_from_slice(&task.exec_time.to_le_bytes());
    let mut field = [0u8; MAX_TASK_ARG];
    field[..arg_len].copy_from_slice(&arg[..arg_len]);
    out.extend_from_slice(&field);
}

fn decode_record(record: &[u8]) -> Task {
    let (Ok(kind), Ok(status), Ok(mode)) = (
        TaskType::try_from(record[0]),
        TaskStatus::try_from(record[1]),
        TaskMode::try_from(record[2]),
    ) else {
        return Task::free();
    };
    let arg_len = usize::from(record[5]).min(MAX_TASK_ARG);
    let mut param = [0u8; 4];
    param.copy_from_slice(&record[8..12]);
    let mut exec_time = [0u8; 8];
    exec_time.copy_from_slice(&record[12..20]);
    Task {
        kind,
        // A task interrupted by a restart runs again.
        status: if status == TaskStatus::InProgress {
            TaskStatus::Pending
        } else {
            status
        },
        mode,
        hour: record[3],
        minute: record[4],
        param: i32::from_le_bytes(param),
        exec_time: i64::from_le_bytes(exec_time),
        arg: String::from_utf8_lossy(&record[20..20 + arg_len]).into_owned(),
    }
}

/// Truncates `arg` to the record's argument field without splitting a character.
fn bounded_arg(arg: &str) -> String {
    let mut end = arg.len().min(MAX_TASK_ARG);
    while !arg.is_char_boundary(end) {
        end -= 1;
    }
    arg[..end].to_string()
}

/// The fixed-capacity task table and its backing file.
#[derive(Debug)]
pub struct TaskTable {
    slots: Vec<Task>,
    path: Option<PathBuf>,
}

impl TaskTable {
    /// A table that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            slots: vec![Task::free(); MAX_TASKS],
            path: None,
        }
    }

    /// Loads the table from `path`. A missing or malformed file means no tasks.
    pub fn load(path: &Path) -> Self {
        let mut table = Self {
            path: Some(path.to_path_buf()),
            ..Self::in_memory()
        };
        match fs::read(path) {
            Ok(bytes) if bytes.len() == RECORD_LEN * MAX_TASKS => {
                for (slot, record) in table.slots.iter_mut().zip(bytes.chunks_exact(RECORD_LEN)) {
                    *slot = decode_record(record);
                }
                info!("Loaded {} pending tasks from {}", table.pending().count(), path.display());
            }
            Ok(bytes) => warn!(
                "Ignoring task file {} of {} bytes (expected {})",
                path.display(),
                bytes.len(),
                RECORD_LEN * MAX_TASKS
            ),
            Err(e) => debug!("No task file at {}: {}", path.display(), e),
        }
        table
    }

    /// Writes every slot back to the backing file.
    pub fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut bytes = Vec::with_capacity(RECORD_LEN * MAX_TASKS);
        for task in &self.slots {
            encode_record(task, &mut bytes);
        }
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(path, bytes)?;
        Ok(())
    }

    fn persist_logged(&self) {
        if let Err(e) = self.persist() {
            error!("Failed to persist task table: {:?}", e);
        }
    }

    /// Stores `request` in the first free slot.
    pub fn add_task<Tz: TimeZone>(&mut self, request: TaskRequest, now: &DateTime<Tz>) -> Result<TaskId, ProxyError> {
        let id = self
            .slots
            .iter()
            .position(|t| t.status == TaskStatus::Free)
            .ok_or(ProxyError::TableFull)?;
        let exec_time = compute_exec_time(request.mode, request.hour, request.minute, now);
        self.slots[id] = Task {
            kind: request.kind,
            param: request.param,
            status: TaskStatus::Pending,
            mode: request.mode,
            hour: request.hour,
            minute: request.minute,
            exec_time,
            arg: bounded_arg(&request.arg),
        };
        info!("Scheduled {:?} as task {} for {}", request.kind, id, exec_time);
        self.persist_logged();
        Ok(id)
    }

    /// Frees a Pending slot. Returns whether one was removed.
    pub fn remove_task(&mut self, id: TaskId) -> bool {
        match self.slots.get_mut(id) {
            Some(task) if task.status == TaskStatus::Pending => {
                *task = Task::free();
                self.persist_logged();
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.slots.get(id).filter(|t| t.status != TaskStatus::Free)
    }

    pub fn pending(&self) -> impl Iterator<Item = (TaskId, &Task)> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, t)| t.status == TaskStatus::Pending)
    }

    /// Marks every Pending task due at `now` as InProgress and returns them.
    pub fn take_due(&mut self, now: i64) -> Vec<(TaskId, Task)> {
        let mut due = Vec::new();
        for (id, task) in self.slots.iter_mut().enumerate() {
            if task.status == TaskStatus::Pending && task.exec_time <= now {
                task.status = TaskStatus::InProgress;
                due.push((id, task.clone()));
            }
        }
        due
    }

    /// Records the outcome of an InProgress task.
    pub fn finish(&mut self, id: TaskId, ok: bool) {
        match self.slots.get_mut(id) {
            Some(task) if task.status == TaskStatus::InProgress => {
                task.status = if ok { TaskStatus::Done } else { TaskStatus::Failed };
                info!("Task {} ({:?}) {}", id, task.kind, if ok { "done" } else { "failed" });
                self.persist_logged();
            }
            _ => warn!("Ignoring outcome for task {} which is not in progress", id),
        }
    }

    /// Frees Done and Failed slots, persisting if anything changed.
    pub fn sweep(&mut self) -> usize {
        let mut freed = 0;
        for task in self.slots.iter_mut() {
            if matches!(task.status, TaskStatus::Done | TaskStatus::Failed) {
                *task = Task::free();
                freed += 1;
            }
        }
        if freed > 0 {
            debug!("Reclaimed {} finished task slots", freed);
            self.persist_logged();
        }
        freed
    }
}

/// Locks the shared table, recovering it if a holder panicked.
pub fn lock(table: &Mutex<TaskTable>) -> MutexGuard<'_, TaskTable> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One scheduler tick: hand due tasks to the proxy loop, and every few ticks
/// reclaim finished slots. A handed-off task stays InProgress until the proxy
/// loop records its outcome.
pub fn tick(table: &Mutex<TaskTable>, jobs: &Sender<Job>, now: i64, count: u32) {
    let mut table = lock(table);
    for (id, task) in table.take_due(now) {
        let job = Job {
            task: id,
            command: task.command(),
        };
        if jobs.send(job).is_ok() {
            debug!("Task {} ({:?}) handed to the proxy loop", id, task.kind);
        } else {
            error!("Task {} ({:?}) cannot run: proxy loop is gone", id, task.kind);
            table.finish(id, false);
        }
    }
    if count % SWEEP_EVERY_TICKS == 0 {
        table.sweep();
    }
}

/// Starts the 1 Hz scheduler thread.
pub fn spawn(table: Arc<Mutex<TaskTable>>, jobs: Sender<Job>) -> Result<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("scheduler".into())
        .spawn(move || {
            let mut count: u32 = 0;
            loop {
                thread::sleep(Duration::from_secs(1));
                count = count.wrapping_add(1);
                tick(&table, &jobs, Local::now().timestamp(), count);
            }
        })?;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, Utc};
    use std::sync::mpsc;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 18, hour, minute, 0).unwrap()
    }

    fn request(kind: TaskType, mode: TaskMode, hour: u8, minute: u8, arg: &str) -> TaskRequest {
        TaskRequest {
            kind,
            param: 0,
            mode,
            hour,
            minute,
            arg: arg.into(),
        }
    }

    #[test]
    fn at_time_later_today_stays_today() {
        let now = at(0, 0);
        let exec = compute_exec_time(TaskMode::AtTime, 23, 59, &now);
        assert_eq!(exec, at(23, 59).timestamp());
    }

    #[test]
    fn at_time_already_passed_rolls_to_tomorrow() {
        let now = at(23, 59);
        let exec = compute_exec_time(TaskMode::AtTime, 0, 0, &now);
        assert_eq!(exec, at(0, 0).timestamp() + 86_400);
        // The current minute itself is not in the future either.
        assert_eq!(compute_exec_time(TaskMode::AtTime, 23, 59, &now), now.timestamp() + 86_400);
    }

    #[test]
    fn at_time_respects_the_local_offset() {
        let tz = FixedOffset::east_opt(2 * 3600).unwrap();
        let now = tz.with_ymd_and_hms(2026, 10, 18, 8, 0, 0).unwrap();
        let exec = compute_exec_time(TaskMode::AtTime, 9, 30, &now);
        assert_eq!(exec, now.timestamp() + 90 * 60);
    }

    #[test]
    fn countdown_adds_hours_and_minutes() {
        let now = at(12, 0);
        assert_eq!(compute_exec_time(TaskMode::Countdown, 0, 5, &now), now.timestamp() + 300);
        assert_eq!(compute_exec_time(TaskMode::Countdown, 2, 1, &now), now.timestamp() + 7260);
    }

    #[test]
    fn add_uses_first_free_slot_until_full() {
        let mut table = TaskTable::in_memory();
        let now = at(10, 0);
        assert_eq!(table.add_task(request(TaskType::Sms, TaskMode::Countdown, 0, 1, "a"), &now).unwrap(), 0);
        assert_eq!(table.add_task(request(TaskType::Call, TaskMode::Countdown, 0, 1, ""), &now).unwrap(), 1);
        assert!(table.remove_task(0));
        assert!(!table.remove_task(0));
        assert_eq!(table.add_task(request(TaskType::Sms, TaskMode::Countdown, 0, 1, "b"), &now).unwrap(), 0);

        for _ in 2..MAX_TASKS {
            table.add_task(request(TaskType::Sms, TaskMode::Countdown, 0, 1, "x"), &now).unwrap();
        }
        assert!(matches!(
            table.add_task(request(TaskType::Sms, TaskMode::Countdown, 0, 1, "y"), &now),
            Err(ProxyError::TableFull)
        ));
    }

    #[test]
    fn table_survives_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.bin");
        let now = at(10, 0);
        {
            let mut table = TaskTable::load(&path);
            table.add_task(request(TaskType::Sms, TaskMode::AtTime, 18, 30, "take the bins out"), &now).unwrap();
            let mut wake = request(TaskType::WakeHost, TaskMode::Countdown, 1, 0, "");
            wake.param = 30;
            table.add_task(wake, &now).unwrap();
        }
        let table = TaskTable::load(&path);
        let pending: Vec<_> = table.pending().collect();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].1.arg, "take the bins out");
        assert_eq!(pending[0].1.exec_time, at(18, 30).timestamp());
        assert_eq!(pending[1].1.command(), Command::WakeHost(Duration::from_secs(30)));
    }

    #[test]
    fn truncated_file_means_no_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.bin");
        fs::write(&path, vec![1u8; RECORD_LEN * 3]).unwrap();
        assert_eq!(TaskTable::load(&path).pending().count(), 0);
    }

    #[test]
    fn long_arguments_are_bounded() {
        let mut table = TaskTable::in_memory();
        let long = "é".repeat(MAX_TASK_ARG);
        let id = table.add_task(request(TaskType::Sms, TaskMode::Countdown, 0, 1, &long), &at(1, 0)).unwrap();
        let arg = &table.get(id).unwrap().arg;
        assert!(arg.len() <= MAX_TASK_ARG);
        assert_eq!(arg.chars().count(), MAX_TASK_ARG / 2);
    }

    #[test]
    fn tick_fires_due_tasks_and_sweeps() {
        let table = Mutex::new(TaskTable::in_memory());
        let now = at(10, 0);
        lock(&table).add_task(request(TaskType::Sms, TaskMode::Countdown, 0, 1, "hi"), &now).unwrap();
        lock(&table).add_task(request(TaskType::Call, TaskMode::Countdown, 1, 0, ""), &now).unwrap();
        let (tx, rx) = mpsc::channel();

        tick(&table, &tx, now.timestamp() + 30, 1);
        assert!(rx.try_recv().is_err());

        tick(&table, &tx, now.timestamp() + 60, 2);
        let job = rx.try_recv().unwrap();
        assert_eq!(job, Job { task: 0, command: Command::InjectSms("hi".into()) });
        assert_eq!(lock(&table).get(0).unwrap().status, TaskStatus::InProgress);

        // Not finished yet: the sweep leaves it alone and it does not fire twice.
        tick(&table, &tx, now.timestamp() + 61, SWEEP_EVERY_TICKS);
        assert!(rx.try_recv().is_err());
        assert_eq!(lock(&table).get(0).unwrap().status, TaskStatus::InProgress);

        lock(&table).finish(job.task, true);
        assert_eq!(lock(&table).get(0).unwrap().status, TaskStatus::Done);
        tick(&table, &tx, now.timestamp() + 62, 2 * SWEEP_EVERY_TICKS);
        assert!(lock(&table).get(0).is_none());
        assert_eq!(lock(&table).pending().count(), 1);
    }

    #[test]
    fn outcomes_are_persisted_when_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.bin");
        let now = at(10, 0);
        let table = Mutex::new(TaskTable::load(&path));
        let id = lock(&table).add_task(request(TaskType::Sms, TaskMode::Countdown, 0, 0, "a"), &now).unwrap();
        let (tx, _rx) = mpsc::channel();
        tick(&table, &tx, now.timestamp(), 1);
        lock(&table).finish(id, false);

        // A restart before the next sweep must not run the task again.
        let reloaded = TaskTable::load(&path);
        assert_eq!(reloaded.get(id).unwrap().status, TaskStatus::Failed);
        assert_eq!(reloaded.pending().count(), 0);
    }

    #[test]
    fn outcomes_only_apply_to_running_tasks() {
        let mut table = TaskTable::in_memory();
        let id = table.add_task(request(TaskType::Call, TaskMode::Countdown, 1, 0, ""), &at(1, 0)).unwrap();
        table.finish(id, true);
        assert_eq!(table.get(id).unwrap().status, TaskStatus::Pending);
    }

    #[test]
    fn tasks_fail_when_the_proxy_is_gone() {
        let table = Mutex::new(TaskTable::in_memory());
        let now = at(10, 0);
        lock(&table).add_task(request(TaskType::Call, TaskMode::Countdown, 0, 0, ""), &now).unwrap();
        let (tx, rx) = mpsc::channel();
        drop(rx);
        tick(&table, &tx, now.timestamp(), 1);
        assert_eq!(lock(&table).get(0).unwrap().status, TaskStatus::Failed);
    }
}
