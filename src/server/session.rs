//! Per-connection session state machine.
//!
//! `UNREGISTERED -> REGISTERED -> (CONN_OPEN) -> CLOSED`. Frames other
//! than RegisterSession/ListServices/ListIdentity are rejected while
//! unregistered.

use std::time::Instant;

use crate::error::{CipdipError, Result};
use crate::wire::enip::EnipCommand;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unregistered,
    Registered,
    ConnOpen,
    Closed,
}

pub struct ImplicitConnection {
    pub o_to_t_connection_id: u32,
    pub t_to_o_connection_id: u32,
    pub connection_serial: u16,
    pub rpi_us: u32,
    pub last_traffic: Instant,
    pub sequence: u16,
}

pub struct ServerSession {
    pub state: SessionState,
    pub session_handle: u32,
    pub last_activity: Instant,
    pub connection: Option<ImplicitConnection>,
}

impl ServerSession {
    pub fn new(session_handle: u32) -> Self {
        ServerSession {
            state: SessionState::Unregistered,
            session_handle,
            last_activity: Instant::now(),
            connection: None,
        }
    }

    /// Validates that `command` is permitted in the current state.
    /// RegisterSession/ListServices/ListIdentity are allowed even while
    /// unregistered; everything else requires a registered handle.
    pub fn check_command_allowed(&self, command: u16) -> Result<()> {
        let always_allowed = matches!(
            EnipCommand::from_u16(command),
            Some(EnipCommand::RegisterSession)
                | Some(EnipCommand::ListServices)
                | Some(EnipCommand::ListIdentity)
        );
        if always_allowed {
            return Ok(());
        }
        if self.state == SessionState::Unregistered || self.state == SessionState::Closed {
            return Err(CipdipError::ProtocolFraming(format!(
                "command 0x{command:04x} rejected: session not registered"
            )));
        }
        Ok(())
    }

    pub fn register(&mut self) {
        self.state = SessionState::Registered;
        self.touch();
    }

    pub fn open_connection(&mut self, connection: ImplicitConnection) {
        self.connection = Some(connection);
        self.state = SessionState::ConnOpen;
        self.touch();
    }

    pub fn close_connection(&mut self) {
        self.connection = None;
        if self.state == SessionState::ConnOpen {
            self.state = SessionState::Registered;
        }
        self.touch();
    }

    pub fn close(&mut self) {
        self.connection = None;
        self.state = SessionState::Closed;
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Whether the implicit connection has been idle longer than
    /// `multiplier * rpi`, the connection-reaper threshold.
    pub fn connection_idle_expired(&self, multiplier: u32) -> bool {
        match &self.connection {
            Some(c) => {
                let threshold = std::time::Duration::from_micros(c.rpi_us as u64) * multiplier;
                c.last_traffic.elapsed() > threshold
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_registration_commands_before_register() {
        let session = ServerSession::new(0);
        assert!(session.check_command_allowed(EnipCommand::SendRRData as u16).is_err());
        assert!(session.check_command_allowed(EnipCommand::RegisterSession as u16).is_ok());
    }

    #[test]
    fn register_then_send_rrdata_is_allowed() {
        let mut session = ServerSession::new(1);
        session.register();
        assert!(session.check_command_allowed(EnipCommand::SendRRData as u16).is_ok());
    }

    #[test]
    fn closing_connection_returns_to_registered_not_unregistered() {
        let mut session = ServerSession::new(1);
        session.register();
        session.open_connection(ImplicitConnection {
            o_to_t_connection_id: 1,
            t_to_o_connection_id: 2,
            connection_serial: 1,
            rpi_us: 10_000,
            last_traffic: Instant::now(),
            sequence: 0,
        });
        assert_eq!(session.state, SessionState::ConnOpen);
        session.close_connection();
        assert_eq!(session.state, SessionState::Registered);
    }
}
