//! Command Dispatcher
//!
//! Turns motion and relay commands into profile writes on the bound session.
//! Commands issued while no session is bound are dropped, never queued, so a
//! stale "forward" cannot reach the robot after a reconnect.

use crate::domain::error::Result;
use crate::infrastructure::bluetooth::protocol::{Command, MotionAction, Relay};
use crate::infrastructure::bluetooth::session::GattSession;
use tracing::{debug, info};

#[derive(Default)]
pub struct CommandDispatcher {
    session: Option<GattSession>,
}

impl CommandDispatcher {
    pub fn new(session: GattSession) -> Self {
        Self {
            session: Some(session),
        }
    }

    pub fn bind(&mut self, session: GattSession) {
        self.session = Some(session);
    }

    pub fn unbind(&mut self) -> Option<GattSession> {
        self.session.take()
    }

    pub fn is_bound(&self) -> bool {
        self.session.is_some()
    }

    /// Send a motion command.
    ///
    /// Returns the submitted command, or `None` if it was dropped because no
    /// session is bound. Write failures are returned as-is; nothing is retried.
    pub fn send_motion(&self, action: MotionAction) -> Result<Option<Command>> {
        let sent = self.submit(Command::motion(action))?;
        if sent.is_some() {
            info!("{}", action.label());
        }
        Ok(sent)
    }

    /// Switch one relay on or off
    pub fn send_relay(&self, relay: Relay, on: bool) -> Result<Option<Command>> {
        let sent = self.submit(Command::relay(relay, on))?;
        if sent.is_some() {
            info!("Turn relay {} {}", relay.number(), if on { "on" } else { "off" });
        }
        Ok(sent)
    }

    fn submit(&self, command: Command) -> Result<Option<Command>> {
        let Some(session) = &self.session else {
            debug!("No session bound, dropping {:?}", command);
            return Ok(None);
        };

        session.write(command.service, command.characteristic, &command.as_bytes())?;
        Ok(Some(command))
    }
}
