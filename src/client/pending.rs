use std::sync::{Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::{debug, warn};
use crate::message::{Envelope, MessageCode};
use crate::status::IpcError;

pub type ReplyReceiver = oneshot::Receiver<Result<Envelope, IpcError>>;

struct Waiter {
    code: MessageCode,
    tx: oneshot::Sender<Result<Envelope, IpcError>>,
}

struct SlotState {
    waiter: Option<Waiter>,
    /// replies still to come for commands whose callers gave up waiting. Replies arrive in
    ///  command order, so the next `abandoned` replies are discarded.
    abandoned: usize,
    closed: Option<IpcError>,
}

/// The single-occupancy slot that matches a session's command replies to the waiting caller.
///
/// There is no request id on the wire: the reply to the command in flight is simply the next
///  command-range envelope that arrives. So this relies on the session never having more than
///  one command in flight, which callers ensure by holding the session's command lock from
///  [PendingCommandSlot::arm] until the reply was received (or given up on).
pub struct PendingCommandSlot {
    state: Mutex<SlotState>,
}

impl PendingCommandSlot {
    pub fn new() -> PendingCommandSlot {
        PendingCommandSlot {
            state: Mutex::new(SlotState {
                waiter: None,
                abandoned: 0,
                closed: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<SlotState> {
        self.state.lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Register interest in the reply to a command with the given code, before the command is
    ///  sent
    pub fn arm(&self, code: MessageCode) -> Result<ReplyReceiver, IpcError> {
        let mut state = self.lock();
        if let Some(reason) = &state.closed {
            return Err(reason.clone());
        }
        if let Some(stale) = state.waiter.take() {
            // the previous caller was cancelled while waiting, its reply is still to come
            debug!("previous wait for {:?} was cancelled", stale.code);
            state.abandoned += 1;
        }

        let (tx, rx) = oneshot::channel();
        state.waiter = Some(Waiter { code, tx });
        Ok(rx)
    }

    /// Withdraw the waiter for a command that was never sent completely
    pub fn disarm(&self) {
        self.lock().waiter = None;
    }

    /// Give up waiting for the reply, e.g. after a timeout. Returns `false` if the reply
    ///  (or a failure) was handed over in the meantime and is waiting in the receiver.
    pub fn abandon(&self) -> bool {
        let mut state = self.lock();
        if state.waiter.take().is_some() {
            state.abandoned += 1;
            true
        }
        else {
            false
        }
    }

    /// Called by the receive loop for every envelope in the command range
    pub fn complete(&self, envelope: Envelope) {
        let mut state = self.lock();
        if state.abandoned > 0 {
            state.abandoned -= 1;
            debug!("discarding late reply {:?}", envelope.code);
            return;
        }

        match state.waiter.take() {
            Some(waiter) => {
                let result = if waiter.code == envelope.code {
                    Ok(envelope)
                }
                else {
                    warn!("received reply {:?} while waiting for {:?}", envelope.code, waiter.code);
                    Err(IpcError::UnexpectedCode { expected: waiter.code, actual: envelope.code })
                };
                if waiter.tx.send(result).is_err() {
                    debug!("caller stopped waiting for {:?}", waiter.code);
                }
            }
            None => {
                warn!("received reply {:?} without a pending command - discarding", envelope.code);
            }
        }
    }

    /// Fail the pending command (if any) and all future ones with `reason`
    pub fn close(&self, reason: IpcError) {
        let mut state = self.lock();
        if let Some(waiter) = state.waiter.take() {
            let _ = waiter.tx.send(Err(reason.clone()));
        }
        if state.closed.is_none() {
            state.closed = Some(reason);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }
}

impl Default for PendingCommandSlot {
    fn default() -> Self {
        PendingCommandSlot::new()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{AdapterCommandCode, ResultWord};
    use crate::status::BtStatus;

    fn reply(code: AdapterCommandCode, value: u32) -> Envelope {
        let mut result = Envelope::new(code);
        result.result = ResultWord::from_u32(value);
        result
    }

    #[tokio::test]
    async fn test_complete() {
        let slot = PendingCommandSlot::new();
        let rx = slot.arm(AdapterCommandCode::GetState.into()).unwrap();
        slot.complete(reply(AdapterCommandCode::GetState, 4));

        let received = rx.await.unwrap().unwrap();
        assert_eq!(received.result.as_u32(), 4);
    }

    #[tokio::test]
    async fn test_unexpected_code() {
        let slot = PendingCommandSlot::new();
        let rx = slot.arm(AdapterCommandCode::GetState.into()).unwrap();
        slot.complete(reply(AdapterCommandCode::GetName, 0));

        assert_eq!(rx.await.unwrap(), Err(IpcError::UnexpectedCode {
            expected: AdapterCommandCode::GetState.into(),
            actual: AdapterCommandCode::GetName.into(),
        }));
    }

    #[tokio::test]
    async fn test_unsolicited_reply_is_dropped() {
        let slot = PendingCommandSlot::new();
        slot.complete(reply(AdapterCommandCode::Enable, 1));

        let rx = slot.arm(AdapterCommandCode::Disable.into()).unwrap();
        slot.complete(reply(AdapterCommandCode::Disable, 2));
        assert_eq!(rx.await.unwrap().unwrap().result.as_u32(), 2);
    }

    #[tokio::test]
    async fn test_late_reply_after_abandon_is_discarded() {
        let slot = PendingCommandSlot::new();
        let _rx = slot.arm(AdapterCommandCode::Enable.into()).unwrap();
        assert!(slot.abandon());

        let rx = slot.arm(AdapterCommandCode::GetState.into()).unwrap();
        slot.complete(reply(AdapterCommandCode::Enable, 0));
        slot.complete(reply(AdapterCommandCode::GetState, 2));

        assert_eq!(rx.await.unwrap().unwrap().result.as_u32(), 2);
    }

    #[tokio::test]
    async fn test_abandon_after_completion() {
        let slot = PendingCommandSlot::new();
        let mut rx = slot.arm(AdapterCommandCode::Enable.into()).unwrap();
        slot.complete(reply(AdapterCommandCode::Enable, 0));

        assert!(!slot.abandon());
        assert!(rx.try_recv().unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_waiter() {
        let slot = PendingCommandSlot::new();
        drop(slot.arm(AdapterCommandCode::Enable.into()).unwrap());

        let rx = slot.arm(AdapterCommandCode::Disable.into()).unwrap();
        slot.complete(reply(AdapterCommandCode::Enable, 0));
        slot.complete(reply(AdapterCommandCode::Disable, 7));
        assert_eq!(rx.await.unwrap().unwrap().result.as_u32(), 7);
    }

    #[tokio::test]
    async fn test_close_fails_current_and_future_waiters() {
        let slot = PendingCommandSlot::new();
        let rx = slot.arm(AdapterCommandCode::Enable.into()).unwrap();

        let reason = IpcError::TransportDown("peer closed".to_string());
        slot.close(reason.clone());
        assert_eq!(rx.await.unwrap(), Err(reason.clone()));

        assert!(slot.is_closed());
        assert_eq!(slot.arm(AdapterCommandCode::Enable.into()).unwrap_err(), reason);

        slot.close(IpcError::Status(BtStatus::Fail));
        assert_eq!(slot.arm(AdapterCommandCode::Enable.into()).unwrap_err(), reason);
    }
}
