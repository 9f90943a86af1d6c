//! Point-to-point call signaling on top of the calls hub.
//!
//! A call moves `invited → answered → active` and leaves the table as either
//! `ended` (hangup) or `timed-out` (nobody answered). Each pending invite has
//! one timer task; answering or hanging up aborts it.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use frbook_common::id::{prefix, prefixed_ulid};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::task::AbortHandle;
use tokio::time;

use super::events::{
    CallAnswerPayload, CallHangupPayload, CallInvitePayload, CallSignalPayload, ClientMessage,
    Event, EventName, OP_CALL_ANSWER, OP_CALL_HANGUP, OP_CALL_INVITE, OP_CALL_SIGNAL,
};
use super::registry::{Hub, InboundHandler};
use super::session::Session;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("user {0} has no live session")]
    UserOffline(String),
    #[error("call {0} has ended or timed out")]
    StaleCall(String),
    #[error("call {0} is not active yet")]
    NotActive(String),
    #[error("not a participant of call {0}")]
    NotParticipant(String),
}

impl RelayError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::UserOffline(_) => "USER_OFFLINE",
            Self::StaleCall(_) => "STALE_CALL",
            Self::NotActive(_) => "NOT_ACTIVE",
            Self::NotParticipant(_) => "NOT_PARTICIPANT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallPhase {
    Invited,
    Answered,
    Active,
    Ended,
    TimedOut,
}

/// State of one call handshake.
#[derive(Debug)]
pub struct CallSession {
    pub call_id: String,
    pub caller_id: String,
    pub callee_id: String,
    /// Session the caller invited from, when known.
    pub caller_session: Option<String>,
    /// Session that answered.
    pub callee_session: Option<String>,
    pub phase: CallPhase,
    pub created_at: DateTime<Utc>,
    timer: Option<AbortHandle>,
}

impl CallSession {
    /// The other side of the call, as `(user_id, bound session)`.
    fn counterpart(&self, user_id: &str) -> Option<(&str, Option<&str>)> {
        if user_id == self.caller_id {
            Some((self.callee_id.as_str(), self.callee_session.as_deref()))
        } else if user_id == self.callee_id {
            Some((self.caller_id.as_str(), self.caller_session.as_deref()))
        } else {
            None
        }
    }

    fn involves_session(&self, session_id: &str) -> bool {
        self.caller_session.as_deref() == Some(session_id)
            || self.callee_session.as_deref() == Some(session_id)
    }

    fn stop_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

pub struct SignalingRelay {
    hub: Arc<Hub>,
    calls: DashMap<String, CallSession>,
    invite_timeout: Duration,
    me: Weak<SignalingRelay>,
}

impl SignalingRelay {
    /// Build a relay over `hub` and install it as the hub's inbound handler.
    pub fn new(hub: Arc<Hub>, invite_timeout: Duration) -> Arc<Self> {
        let relay = Arc::new_cyclic(|me| Self {
            hub,
            calls: DashMap::new(),
            invite_timeout,
            me: me.clone(),
        });
        let handler: Weak<dyn InboundHandler> = Arc::downgrade(&relay) as Weak<dyn InboundHandler>;
        relay.hub.set_inbound_handler(handler);
        relay
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Ring every session of `callee_id`. Fails with `UserOffline` when the
    /// callee has no session on the calls hub.
    pub fn invite(
        &self,
        caller_id: &str,
        callee_id: &str,
        caller_session: Option<&str>,
    ) -> Result<String, RelayError> {
        if self.hub.user_session_count(callee_id) == 0 {
            return Err(RelayError::UserOffline(callee_id.to_string()));
        }

        let call_id = prefixed_ulid(prefix::CALL);
        let created_at = Utc::now();
        self.calls.insert(
            call_id.clone(),
            CallSession {
                call_id: call_id.clone(),
                caller_id: caller_id.to_string(),
                callee_id: callee_id.to_string(),
                caller_session: caller_session.map(str::to_string),
                callee_session: None,
                phase: CallPhase::Invited,
                created_at,
                timer: None,
            },
        );

        let timer = self.spawn_timeout(call_id.clone());
        match self.calls.get_mut(&call_id) {
            Some(mut call) => call.timer = Some(timer),
            // Already expired.
            None => timer.abort(),
        }

        let ringing = self.hub.notify(
            callee_id,
            Event::to_user(
                EventName::CALL_INVITE,
                callee_id,
                serde_json::json!({
                    "call_id": call_id,
                    "caller_id": caller_id,
                    "created_at": created_at,
                }),
            ),
        );
        if ringing == 0 {
            // The callee left between the check and the ring.
            if let Some((_, mut call)) = self.calls.remove(&call_id) {
                call.stop_timer();
            }
            return Err(RelayError::UserOffline(callee_id.to_string()));
        }

        tracing::info!(%call_id, %caller_id, %callee_id, ringing, "call invited");
        Ok(call_id)
    }

    /// Accept a ringing call from one of the callee's sessions.
    pub fn answer(&self, call_id: &str, callee_session_id: &str) -> Result<(), RelayError> {
        let session = self.hub.find_session(callee_session_id);

        let (caller_id, caller_session, callee_id) = {
            let mut call = self
                .calls
                .get_mut(call_id)
                .ok_or_else(|| RelayError::StaleCall(call_id.to_string()))?;
            if call.phase != CallPhase::Invited {
                return Err(RelayError::StaleCall(call_id.to_string()));
            }
            match &session {
                Some(s) if s.user_id == call.callee_id => {}
                _ => return Err(RelayError::NotParticipant(call_id.to_string())),
            }

            call.phase = CallPhase::Answered;
            call.callee_session = Some(callee_session_id.to_string());
            call.stop_timer();
            call.phase = CallPhase::Active;
            (
                call.caller_id.clone(),
                call.caller_session.clone(),
                call.callee_id.clone(),
            )
        };

        let data = serde_json::json!({ "call_id": call_id, "session_id": callee_session_id });
        self.deliver(
            &caller_id,
            caller_session.as_deref(),
            Event::to_user(EventName::CALL_ACCEPTED, &caller_id, data.clone()),
        );
        // Lets the callee's other devices stop ringing.
        self.hub.notify(
            &callee_id,
            Event::to_user(EventName::CALL_ACCEPTED, &callee_id, data),
        );

        tracing::info!(%call_id, %caller_id, %callee_id, "call answered");
        Ok(())
    }

    /// Forward a signaling payload to the other participant. The call entry
    /// stays locked during the handoff, so a hangup that got there first wins.
    pub fn relay_payload(
        &self,
        call_id: &str,
        from_user_id: &str,
        payload: Value,
    ) -> Result<(), RelayError> {
        let call = self
            .calls
            .get(call_id)
            .ok_or_else(|| RelayError::StaleCall(call_id.to_string()))?;
        let (to_user, to_session) = call
            .counterpart(from_user_id)
            .ok_or_else(|| RelayError::NotParticipant(call_id.to_string()))?;
        if call.phase != CallPhase::Active {
            return Err(RelayError::NotActive(call_id.to_string()));
        }

        self.deliver(
            to_user,
            to_session,
            Event::to_user(
                EventName::CALL_SIGNAL,
                to_user,
                serde_json::json!({
                    "call_id": call_id,
                    "from": from_user_id,
                    "payload": payload,
                }),
            ),
        );
        Ok(())
    }

    /// End a call and tell both sides. Returns false if it was already gone.
    pub fn hangup(&self, call_id: &str) -> bool {
        let Some((_, mut call)) = self.calls.remove(call_id) else {
            return false;
        };
        call.stop_timer();
        call.phase = CallPhase::Ended;

        let data = serde_json::json!({ "call_id": call_id });
        self.deliver(
            &call.caller_id,
            call.caller_session.as_deref(),
            Event::to_user(EventName::CALL_ENDED, &call.caller_id, data.clone()),
        );
        self.deliver(
            &call.callee_id,
            call.callee_session.as_deref(),
            Event::to_user(EventName::CALL_ENDED, &call.callee_id, data),
        );

        tracing::info!(%call_id, caller_id = %call.caller_id, callee_id = %call.callee_id, "call ended");
        true
    }

    /// Hang up on behalf of a participant.
    pub fn hangup_as(&self, call_id: &str, user_id: &str) -> Result<bool, RelayError> {
        let participant = match self.calls.get(call_id) {
            Some(call) => call.counterpart(user_id).is_some(),
            None => return Ok(false),
        };
        if !participant {
            return Err(RelayError::NotParticipant(call_id.to_string()));
        }
        Ok(self.hangup(call_id))
    }

    pub fn phase(&self, call_id: &str) -> Option<CallPhase> {
        self.calls.get(call_id).map(|call| call.phase)
    }

    pub fn call_count(&self) -> usize {
        self.calls.len()
    }

    /// Ids of calls that have been answered and are relaying.
    pub fn active_calls(&self) -> Vec<String> {
        self.calls
            .iter()
            .filter(|entry| entry.value().phase == CallPhase::Active)
            .map(|entry| entry.key().clone())
            .collect()
    }

    fn spawn_timeout(&self, call_id: String) -> AbortHandle {
        let me = self.me.clone();
        let timeout = self.invite_timeout;
        tokio::spawn(async move {
            time::sleep(timeout).await;
            if let Some(relay) = me.upgrade() {
                relay.expire(&call_id);
            }
        })
        .abort_handle()
    }

    /// Time out a call that is still ringing.
    fn expire(&self, call_id: &str) {
        let Some((_, mut call)) = self
            .calls
            .remove_if(call_id, |_, call| call.phase == CallPhase::Invited)
        else {
            return;
        };
        call.phase = CallPhase::TimedOut;
        call.timer = None;

        let data = serde_json::json!({ "call_id": call_id });
        self.deliver(
            &call.caller_id,
            call.caller_session.as_deref(),
            Event::to_user(EventName::CALL_TIMEOUT, &call.caller_id, data.clone()),
        );
        self.hub.notify(
            &call.callee_id,
            Event::to_user(EventName::CALL_TIMEOUT, &call.callee_id, data),
        );

        tracing::info!(%call_id, caller_id = %call.caller_id, callee_id = %call.callee_id, "call timed out");
    }

    /// Send to a bound session when it is still live, otherwise to every
    /// session of the user.
    fn deliver(&self, user_id: &str, session_id: Option<&str>, event: Event) -> usize {
        if let Some(session) = session_id.and_then(|id| self.hub.find_session(id)) {
            if session.user_id == user_id {
                return usize::from(session.enqueue(Arc::new(event)));
            }
        }
        self.hub.notify(user_id, event)
    }

    fn reply(session: &Arc<Session>, event_name: &str, data: Value) {
        session.enqueue(Arc::new(Event::to_user(event_name, &session.user_id, data)));
    }

    fn reply_error(session: &Arc<Session>, err: &RelayError) {
        Self::reply(
            session,
            EventName::CALL_ERROR,
            serde_json::json!({ "code": err.code(), "message": err.to_string() }),
        );
    }

    fn handle(&self, session: &Arc<Session>, message: ClientMessage) -> Result<(), RelayError> {
        match message.op {
            OP_CALL_INVITE => match serde_json::from_value::<CallInvitePayload>(message.d) {
                Ok(p) => {
                    let call_id =
                        self.invite(&session.user_id, &p.callee_id, Some(&session.session_id))?;
                    Self::reply(
                        session,
                        EventName::CALL_RINGING,
                        serde_json::json!({ "call_id": call_id, "callee_id": p.callee_id }),
                    );
                }
                Err(_) => Self::invalid_payload(session),
            },
            OP_CALL_ANSWER => match serde_json::from_value::<CallAnswerPayload>(message.d) {
                Ok(p) => self.answer(&p.call_id, &session.session_id)?,
                Err(_) => Self::invalid_payload(session),
            },
            OP_CALL_SIGNAL => match serde_json::from_value::<CallSignalPayload>(message.d) {
                Ok(p) => self.relay_payload(&p.call_id, &session.user_id, p.payload)?,
                Err(_) => Self::invalid_payload(session),
            },
            OP_CALL_HANGUP => match serde_json::from_value::<CallHangupPayload>(message.d) {
                Ok(p) => {
                    self.hangup_as(&p.call_id, &session.user_id)?;
                }
                Err(_) => Self::invalid_payload(session),
            },
            op => {
                tracing::debug!(session_id = %session.session_id, op, "unknown call opcode");
                Self::reply(
                    session,
                    EventName::CALL_ERROR,
                    serde_json::json!({ "code": "UNKNOWN_OPCODE", "message": "Unknown opcode" }),
                );
            }
        }
        Ok(())
    }

    fn invalid_payload(session: &Arc<Session>) {
        Self::reply(
            session,
            EventName::CALL_ERROR,
            serde_json::json!({ "code": "INVALID_PAYLOAD", "message": "Invalid payload" }),
        );
    }
}

impl InboundHandler for SignalingRelay {
    fn on_message(&self, session: &Arc<Session>, message: ClientMessage) {
        if let Err(err) = self.handle(session, message) {
            tracing::debug!(session_id = %session.session_id, %err, "call request rejected");
            Self::reply_error(session, &err);
        }
    }

    /// Calls bound to a departing session cannot continue.
    fn on_disconnect(&self, session: &Arc<Session>) {
        let orphaned: Vec<String> = self
            .calls
            .iter()
            .filter(|entry| entry.value().involves_session(&session.session_id))
            .map(|entry| entry.key().clone())
            .collect();
        for call_id in orphaned {
            self.hangup(&call_id);
        }
    }
}
