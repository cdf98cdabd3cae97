use std::fmt;

use video_ingest::SessionId;

/// Why a settled detection result was not applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiscardReason {
    /// The result belongs to a session that is no longer current.
    StaleSession,
    /// A result with the same or a higher sequence was already applied.
    OutOfOrder,
}

impl fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscardReason::StaleSession => f.write_str("stale session"),
            DiscardReason::OutOfOrder => f.write_str("out of order"),
        }
    }
}

/// Admits a result only if it belongs to the current session and carries a
/// sequence above every result already applied in that session.
#[derive(Debug, Default)]
pub struct ResultGate {
    session: Option<SessionId>,
    highest_applied: Option<u64>,
}

impl ResultGate {
    pub fn begin(&mut self, session: SessionId) {
        self.session = Some(session);
        self.highest_applied = None;
    }

    pub fn end(&mut self) {
        self.session = None;
        self.highest_applied = None;
    }

    pub fn session(&self) -> Option<SessionId> {
        self.session
    }

    pub fn highest_applied(&self) -> Option<u64> {
        self.highest_applied
    }

    pub fn admit(&mut self, session: SessionId, sequence: u64) -> Result<(), DiscardReason> {
        if self.session != Some(session) {
            return Err(DiscardReason::StaleSession);
        }
        if self.highest_applied.is_some_and(|highest| sequence <= highest) {
            return Err(DiscardReason::OutOfOrder);
        }
        self.highest_applied = Some(sequence);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_sessions() -> (SessionId, SessionId) {
        (SessionId::from_raw(1), SessionId::from_raw(2))
    }

    #[test]
    fn test_applied_sequences_never_decrease() {
        let (session, _) = two_sessions();
        let mut gate = ResultGate::default();
        gate.begin(session);

        let mut applied = Vec::new();
        for sequence in [2, 1, 3, 3, 5, 4, 6] {
            if gate.admit(session, sequence).is_ok() {
                applied.push(sequence);
            }
        }
        assert_eq!(applied, vec![2, 3, 5, 6]);
        assert_eq!(gate.admit(session, 0), Err(DiscardReason::OutOfOrder));
    }

    #[test]
    fn test_other_session_is_stale() {
        let (old, current) = two_sessions();
        let mut gate = ResultGate::default();
        assert_eq!(gate.admit(current, 1), Err(DiscardReason::StaleSession));

        gate.begin(current);
        assert_eq!(gate.admit(old, 10), Err(DiscardReason::StaleSession));
        assert_eq!(gate.admit(current, 1), Ok(()));

        gate.end();
        assert_eq!(gate.admit(current, 2), Err(DiscardReason::StaleSession));
    }

    #[test]
    fn test_new_session_resets_ordering() {
        let (first, second) = two_sessions();
        let mut gate = ResultGate::default();
        gate.begin(first);
        gate.admit(first, 7).unwrap();
        gate.begin(second);
        assert_eq!(gate.highest_applied(), None);
        assert_eq!(gate.admit(second, 1), Ok(()));
    }
}
