use crate::catalog::TapeId;
use crate::device::ChangerDevice;
use crate::error::{Result, TapeVaultError};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Request class for drive arbitration. Foreground stage-ins outrank
/// background migration and reclaim so user-visible latency stays bounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Background = 0,
    Foreground = 1,
}

#[derive(Debug, Clone)]
struct Ticket {
    id: u64,
    seq: u64,
    tape: TapeId,
    priority: Priority,
}

#[derive(Debug)]
struct MountedTape {
    tape: TapeId,
    refs: usize,
}

#[derive(Debug, Default)]
struct SchedState {
    mounted: Option<MountedTape>,
    /// A load/unload cycle is in flight. Changer motion and drive I/O can
    /// never overlap, so nothing else may touch the drive until it clears.
    transition: bool,
    queue: Vec<Ticket>,
    next_id: u64,
    drive_fault: Option<String>,
    faulty_tapes: HashSet<TapeId>,
}

impl SchedState {
    /// Highest priority first, FIFO within a priority class.
    fn head(&self) -> Option<&Ticket> {
        self.queue
            .iter()
            .max_by(|a, b| a.priority.cmp(&b.priority).then(b.seq.cmp(&a.seq)))
    }

    fn remove_ticket(&mut self, id: u64) {
        self.queue.retain(|t| t.id != id);
    }
}

/// Exclusive arbiter of the single physical drive and the changer.
///
/// `request_mount` blocks until the drive holds the requested tape and
/// returns an RAII session; the tape cannot be unloaded while any session
/// on it is alive. Requests for the tape that is mounted (or being mounted)
/// coalesce onto one load cycle instead of each driving the changer.
pub struct DriveScheduler {
    changer: Arc<dyn ChangerDevice>,
    state: Mutex<SchedState>,
    wakeup: Notify,
    retry_limit: u32,
    retry_backoff: Duration,
}

impl DriveScheduler {
    pub fn new(changer: Arc<dyn ChangerDevice>, retry_limit: u32, retry_backoff: Duration) -> Self {
        DriveScheduler {
            changer,
            state: Mutex::new(SchedState::default()),
            wakeup: Notify::new(),
            retry_limit,
            retry_backoff,
        }
    }

    /// Tape currently in the drive, if any.
    pub fn current_tape(&self) -> Option<TapeId> {
        self.state.lock().mounted.as_ref().map(|m| m.tape.clone())
    }

    /// Live session count on the mounted tape. At most one tape is ever
    /// mounted, so this is also the system-wide in-flight count.
    pub fn session_count(&self) -> usize {
        self.state.lock().mounted.as_ref().map_or(0, |m| m.refs)
    }

    pub fn is_faulted(&self) -> bool {
        self.state.lock().drive_fault.is_some()
    }

    /// Operator acknowledgment: clear drive and tape fault latches.
    pub fn reset_faults(&self) {
        let mut state = self.state.lock();
        state.drive_fault = None;
        state.faulty_tapes.clear();
        drop(state);
        self.wakeup.notify_waiters();
    }

    /// Block until the drive holds `tape`, then return a session on it.
    pub async fn request_mount(
        self: &Arc<Self>,
        tape: &TapeId,
        priority: Priority,
    ) -> Result<DriveSession> {
        let ticket_id = {
            let mut state = self.state.lock();
            self.check_faults(&state, tape)?;
            let id = state.next_id;
            state.next_id += 1;
            state.queue.push(Ticket {
                id,
                seq: id,
                tape: tape.clone(),
                priority,
            });
            id
        };

        // Dropping the guard (caller timed out or was cancelled) removes the
        // ticket so it can never wedge the queue head.
        let mut guard = TicketGuard {
            scheduler: self,
            id: ticket_id,
            armed: true,
        };

        let notified = self.wakeup.notified();
        tokio::pin!(notified);

        loop {
            {
                let mut state = self.state.lock();

                if let Err(e) = self.check_faults(&state, tape) {
                    state.remove_ticket(ticket_id);
                    guard.armed = false;
                    return Err(e);
                }

                // Coalesce onto the mounted tape.
                if !state.transition {
                    if let Some(mounted) = state.mounted.as_mut() {
                        if &mounted.tape == tape {
                            mounted.refs += 1;
                            state.remove_ticket(ticket_id);
                            guard.armed = false;
                            return Ok(DriveSession {
                                scheduler: Arc::clone(self),
                                tape: tape.clone(),
                                active: true,
                            });
                        }
                    }
                }

                // Start a tape change when the drive is idle and the head
                // request wants a different tape than the one loaded. The
                // work runs detached so a cancelled requester can never
                // strand the transition flag.
                if !state.transition && state.mounted.as_ref().map_or(0, |m| m.refs) == 0 {
                    if let Some(head) = state.head().cloned() {
                        let needs_change = state
                            .mounted
                            .as_ref()
                            .map_or(true, |m| m.tape != head.tape);
                        if needs_change {
                            state.transition = true;
                            let old = state.mounted.take().map(|m| m.tape);
                            let target = head.tape.clone();
                            let this = Arc::clone(self);
                            tokio::spawn(async move {
                                this.run_transition(old, target).await;
                            });
                        }
                    }
                }

                // Register for the next wakeup before the lock drops so a
                // completion between unlock and await cannot be missed.
                notified.as_mut().enable();
            }

            notified.as_mut().await;
            notified.set(self.wakeup.notified());
        }
    }

    fn check_faults(&self, state: &SchedState, tape: &TapeId) -> Result<()> {
        if let Some(fault) = &state.drive_fault {
            return Err(TapeVaultError::DeviceUnavailable(format!(
                "drive marked faulty: {}",
                fault
            )));
        }
        if state.faulty_tapes.contains(tape) {
            return Err(TapeVaultError::DeviceUnavailable(format!(
                "tape {} marked faulty",
                tape
            )));
        }
        Ok(())
    }

    /// Perform one unload/load cycle with bounded retries, then publish the
    /// outcome and wake every waiter.
    async fn run_transition(self: Arc<Self>, old: Option<TapeId>, target: TapeId) {
        let result = self.change_tape(old, &target).await;

        let mut state = self.state.lock();
        state.transition = false;
        match result {
            Ok(()) => {
                tracing::info!("Tape {} mounted", target);
                state.mounted = Some(MountedTape {
                    tape: target,
                    refs: 0,
                });
            }
            Err(TapeVaultError::MediaError { tape, detail }) => {
                // The error may name the old tape failing to eject, not
                // the target; fault the cartridge that actually misbehaved.
                tracing::error!("Tape {} faulted during mount cycle: {}", tape, detail);
                state.faulty_tapes.insert(TapeId::new(tape));
                state.mounted = None;
            }
            Err(e) => {
                tracing::error!("Drive faulted: {}", e);
                state.drive_fault = Some(e.to_string());
                state.mounted = None;
            }
        }
        drop(state);
        self.wakeup.notify_waiters();
    }

    async fn change_tape(&self, old: Option<TapeId>, target: &TapeId) -> Result<()> {
        if let Some(old) = old {
            tracing::debug!("Unloading tape {} to make room for {}", old, target);
            self.device_op_with_retry("unload", || {
                let changer = Arc::clone(&self.changer);
                move || changer.unload()
            })
            .await?;
        }
        self.device_op_with_retry("load", || {
            let changer = Arc::clone(&self.changer);
            let tape = target.clone();
            move || changer.load(&tape)
        })
        .await
    }

    /// Run a blocking changer command, retrying transient failures with
    /// increasing backoff up to the retry limit.
    async fn device_op_with_retry<F, G>(&self, what: &str, make_op: F) -> Result<()>
    where
        F: Fn() -> G,
        G: FnOnce() -> Result<()> + Send + 'static,
    {
        let mut backoff = self.retry_backoff;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let op = make_op();
            let result = tokio::task::spawn_blocking(op)
                .await
                .map_err(|e| TapeVaultError::DeviceUnavailable(format!("device task: {}", e)))?;

            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt <= self.retry_limit => {
                    tracing::warn!(
                        "Changer {} attempt {} failed ({}), retrying in {:?}",
                        what,
                        attempt,
                        e,
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) if e.is_transient() => {
                    return Err(TapeVaultError::DeviceUnavailable(format!(
                        "changer {} failed after {} attempts: {}",
                        what, attempt, e
                    )));
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn release_session(&self, tape: &TapeId) {
        let mut state = self.state.lock();
        if let Some(mounted) = state.mounted.as_mut() {
            if &mounted.tape == tape {
                debug_assert!(mounted.refs > 0, "release without matching session");
                mounted.refs = mounted.refs.saturating_sub(1);
            }
        }
        drop(state);
        self.wakeup.notify_waiters();
    }
}

struct TicketGuard<'a> {
    scheduler: &'a DriveScheduler,
    id: u64,
    armed: bool,
}

impl Drop for TicketGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.scheduler.state.lock().remove_ticket(self.id);
            self.scheduler.wakeup.notify_waiters();
        }
    }
}

/// A live claim on the mounted tape. The drive cannot switch tapes while
/// any session is alive; dropping the session releases the claim.
pub struct DriveSession {
    scheduler: Arc<DriveScheduler>,
    tape: TapeId,
    active: bool,
}

impl std::fmt::Debug for DriveSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriveSession")
            .field("tape", &self.tape)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

impl DriveSession {
    pub fn tape(&self) -> &TapeId {
        &self.tape
    }

    pub fn release(mut self) {
        self.do_release();
    }

    fn do_release(&mut self) {
        if self.active {
            self.active = false;
            self.scheduler.release_session(&self.tape);
        }
    }
}

impl Drop for DriveSession {
    fn drop(&mut self) {
        self.do_release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SimLibrary;

    fn library_with(tapes: &[&str]) -> Arc<SimLibrary> {
        let lib = Arc::new(SimLibrary::new());
        for (i, tag) in tapes.iter().enumerate() {
            lib.add_tape(&TapeId::new(*tag), i as u32 + 1, 1_000_000, true);
        }
        lib
    }

    fn scheduler(lib: &Arc<SimLibrary>) -> Arc<DriveScheduler> {
        Arc::new(DriveScheduler::new(
            lib.clone(),
            2,
            Duration::from_millis(1),
        ))
    }

    #[tokio::test]
    async fn test_mount_and_release() {
        let lib = library_with(&["A"]);
        let sched = scheduler(&lib);

        let session = sched
            .request_mount(&TapeId::new("A"), Priority::Foreground)
            .await
            .unwrap();
        assert_eq!(sched.current_tape(), Some(TapeId::new("A")));
        assert_eq!(sched.session_count(), 1);

        session.release();
        assert_eq!(sched.session_count(), 0);
        // Lazy unmount: the tape stays in the drive.
        assert_eq!(sched.current_tape(), Some(TapeId::new("A")));
    }

    #[tokio::test]
    async fn test_coalescing_shares_one_load() {
        let lib = library_with(&["A"]);
        let sched = scheduler(&lib);
        let tape = TapeId::new("A");

        let s1 = sched.request_mount(&tape, Priority::Background).await.unwrap();
        let s2 = sched.request_mount(&tape, Priority::Background).await.unwrap();
        let s3 = sched.request_mount(&tape, Priority::Foreground).await.unwrap();

        assert_eq!(lib.load_count(), 1);
        assert_eq!(sched.session_count(), 3);

        drop((s1, s2, s3));
        assert_eq!(sched.session_count(), 0);
    }

    #[tokio::test]
    async fn test_tape_switch_waits_for_sessions() {
        let lib = library_with(&["A", "B"]);
        let sched = scheduler(&lib);

        let session_a = sched
            .request_mount(&TapeId::new("A"), Priority::Background)
            .await
            .unwrap();

        let sched2 = Arc::clone(&sched);
        let waiter = tokio::spawn(async move {
            sched2
                .request_mount(&TapeId::new("B"), Priority::Foreground)
                .await
        });

        // B cannot mount while A has a live session.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        assert_eq!(sched.current_tape(), Some(TapeId::new("A")));

        session_a.release();
        let session_b = waiter.await.unwrap().unwrap();
        assert_eq!(session_b.tape(), &TapeId::new("B"));
        assert_eq!(lib.unload_count(), 1);
    }

    #[tokio::test]
    async fn test_transient_timeouts_retried() {
        let lib = library_with(&["A"]);
        lib.inject_load_timeouts(&TapeId::new("A"), 2);
        let sched = scheduler(&lib);

        let session = sched
            .request_mount(&TapeId::new("A"), Priority::Foreground)
            .await
            .unwrap();
        assert_eq!(session.tape(), &TapeId::new("A"));
    }

    #[tokio::test]
    async fn test_retry_exhaustion_faults_drive_and_drains_waiters() {
        let lib = library_with(&["A"]);
        lib.inject_load_timeouts(&TapeId::new("A"), 10);
        let sched = scheduler(&lib);

        let err = sched
            .request_mount(&TapeId::new("A"), Priority::Foreground)
            .await
            .unwrap_err();
        assert!(matches!(err, TapeVaultError::DeviceUnavailable(_)));
        assert!(sched.is_faulted());

        // Subsequent requests fail fast until the operator resets.
        let err = sched
            .request_mount(&TapeId::new("A"), Priority::Foreground)
            .await
            .unwrap_err();
        assert!(matches!(err, TapeVaultError::DeviceUnavailable(_)));

        sched.reset_faults();
        lib.inject_load_timeouts(&TapeId::new("A"), 0);
        assert!(sched
            .request_mount(&TapeId::new("A"), Priority::Foreground)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_eject_media_error_faults_old_tape_not_target() {
        let lib = library_with(&["A", "B"]);
        let sched = scheduler(&lib);

        let session_a = sched
            .request_mount(&TapeId::new("A"), Priority::Background)
            .await
            .unwrap();
        session_a.release();

        lib.inject_unload_media_errors(1);

        // The eject glitch is charged to A; B still mounts.
        let session_b = sched
            .request_mount(&TapeId::new("B"), Priority::Foreground)
            .await
            .unwrap();
        assert_eq!(session_b.tape(), &TapeId::new("B"));
        session_b.release();

        let err = sched
            .request_mount(&TapeId::new("A"), Priority::Foreground)
            .await
            .unwrap_err();
        assert!(matches!(err, TapeVaultError::DeviceUnavailable(_)));
        assert!(!sched.is_faulted());
    }

    #[tokio::test]
    async fn test_cancelled_waiter_leaves_no_stuck_ticket() {
        let lib = library_with(&["A", "B"]);
        let sched = scheduler(&lib);

        let session_a = sched
            .request_mount(&TapeId::new("A"), Priority::Background)
            .await
            .unwrap();

        let sched2 = Arc::clone(&sched);
        let doomed = tokio::spawn(async move {
            sched2
                .request_mount(&TapeId::new("B"), Priority::Foreground)
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        doomed.abort();
        let _ = doomed.await;

        session_a.release();

        // The aborted request must not block later traffic.
        let session = sched
            .request_mount(&TapeId::new("B"), Priority::Background)
            .await
            .unwrap();
        assert_eq!(session.tape(), &TapeId::new("B"));
    }
}
