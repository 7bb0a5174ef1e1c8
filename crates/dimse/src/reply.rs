//! Reply streams for find and move exchanges
//!
//! A [`ReplyStream`] is a one-shot sequence of replies bounded by a terminal
//! status. Which statuses end the stream is decided by a per-exchange policy
//! over [`StatusClass`]; a failure that the peer may follow with more replies
//! keeps the stream open for a short grace period instead.

use std::time::Duration;

use dicom_object::InMemDicomObject;
use tracing::debug;

use crate::association::AssociationChannel;
use crate::error::{DimseError, Result};
use crate::message::{CommandField, CommandSet};
use crate::status::{classify, StatusClass};

/// What a reply means for the rest of the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    /// More replies follow
    More,
    /// Provisional failure; listen for a further reply during the grace period
    Grace,
    /// Last reply of the exchange
    Terminal,
}

/// Find replies: matches continue, an unprocessable identifier does not end
/// the search.
pub fn find_policy(class: StatusClass) -> Continuation {
    match class {
        StatusClass::Pending => Continuation::More,
        StatusClass::Unprocessable => Continuation::Grace,
        _ => Continuation::Terminal,
    }
}

/// Move replies: a resource shortage may be overridden by a later reply.
pub fn move_policy(class: StatusClass) -> Continuation {
    match class {
        StatusClass::Pending => Continuation::More,
        StatusClass::ResourceExhausted => Continuation::Grace,
        _ => Continuation::Terminal,
    }
}

/// One classified reply
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u16,
    pub class: StatusClass,
    pub continuation: Continuation,
    pub command: CommandSet,
    pub identifier: Option<InMemDicomObject>,
}

pub struct ReplyStream<'a> {
    channel: &'a mut dyn AssociationChannel,
    message_id: u16,
    expected: CommandField,
    policy: fn(StatusClass) -> Continuation,
    reply_timeout: Duration,
    grace: Duration,
    in_grace: bool,
    finished: bool,
}

impl<'a> ReplyStream<'a> {
    pub fn new(
        channel: &'a mut dyn AssociationChannel,
        message_id: u16,
        expected: CommandField,
        policy: fn(StatusClass) -> Continuation,
        reply_timeout: Duration,
        grace: Duration,
    ) -> Self {
        Self {
            channel,
            message_id,
            expected,
            policy,
            reply_timeout,
            grace,
            in_grace: false,
            finished: false,
        }
    }

    /// Whether the stream has ended
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Next reply, or `None` once the stream has ended
    pub async fn next(&mut self) -> Result<Option<Reply>> {
        if self.finished {
            return Ok(None);
        }

        let wait = if self.in_grace { self.grace } else { self.reply_timeout };
        let message = match self.channel.receive(wait).await {
            Ok(message) => message,
            Err(e) if self.in_grace => {
                debug!("No reply after provisional failure ({}), ending stream", e);
                self.finished = true;
                return Ok(None);
            }
            Err(DimseError::Timeout(msg)) => {
                self.finished = true;
                return Err(DimseError::connection_lost(msg));
            }
            Err(e) => {
                self.finished = true;
                return Err(e);
            }
        };

        let command = message.command;
        if command.command_field != self.expected {
            self.finished = true;
            return Err(DimseError::connection_lost(format!(
                "expected {:?}, peer sent {:?}",
                self.expected, command.command_field
            )));
        }
        if let Some(id) = command.message_id_being_responded_to {
            if id != self.message_id {
                self.finished = true;
                return Err(DimseError::connection_lost(format!(
                    "reply to message {} while waiting on {}",
                    id, self.message_id
                )));
            }
        }
        let Some(status) = command.status else {
            self.finished = true;
            return Err(DimseError::connection_lost("reply carries no status"));
        };

        let class = classify(status);
        let continuation = (self.policy)(class);
        match continuation {
            Continuation::Terminal => self.finished = true,
            Continuation::Grace => self.in_grace = true,
            Continuation::More => self.in_grace = false,
        }

        Ok(Some(Reply {
            status,
            class,
            continuation,
            command,
            identifier: message.dataset,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{ScriptedPeer, ScriptedStep};
    use crate::message::DimseMessage;

    fn response(status: u16) -> ScriptedStep {
        ScriptedStep::reply(CommandField::CFindRsp, status)
    }

    #[test]
    fn policies_cover_every_class() {
        assert_eq!(find_policy(StatusClass::Pending), Continuation::More);
        assert_eq!(find_policy(StatusClass::Unprocessable), Continuation::Grace);
        assert_eq!(find_policy(StatusClass::Success), Continuation::Terminal);
        assert_eq!(move_policy(StatusClass::ResourceExhausted), Continuation::Grace);
        assert_eq!(move_policy(StatusClass::Unprocessable), Continuation::Terminal);
        assert_eq!(move_policy(StatusClass::DestinationUnknown), Continuation::Terminal);
    }

    #[tokio::test]
    async fn stream_ends_at_terminal_status() {
        let mut peer = ScriptedPeer::new(vec![response(0xFF00), response(0x0000), response(0xFF00)])
            .into_channel(1);
        peer.send(DimseMessage::new(1, CommandSet::find_rq(5, "1.2.3", 0)))
            .await
            .unwrap();

        let mut stream = ReplyStream::new(
            peer.as_mut(),
            5,
            CommandField::CFindRsp,
            find_policy,
            Duration::from_secs(1),
            Duration::from_millis(10),
        );
        assert_eq!(stream.next().await.unwrap().unwrap().class, StatusClass::Pending);
        assert_eq!(stream.next().await.unwrap().unwrap().class, StatusClass::Success);
        assert!(stream.next().await.unwrap().is_none());
        assert!(stream.is_finished());
    }

    #[tokio::test]
    async fn silence_after_provisional_failure_ends_quietly() {
        let mut peer = ScriptedPeer::new(vec![response(0xFF00), response(0xC000)]).into_channel(1);
        peer.send(DimseMessage::new(1, CommandSet::find_rq(1, "1.2.3", 0)))
            .await
            .unwrap();

        let mut stream = ReplyStream::new(
            peer.as_mut(),
            1,
            CommandField::CFindRsp,
            find_policy,
            Duration::from_secs(1),
            Duration::from_millis(10),
        );
        stream.next().await.unwrap();
        let reply = stream.next().await.unwrap().unwrap();
        assert_eq!(reply.continuation, Continuation::Grace);
        assert!(stream.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn silence_mid_stream_is_connection_lost() {
        let mut peer = ScriptedPeer::new(vec![response(0xFF00)]).into_channel(1);
        peer.send(DimseMessage::new(1, CommandSet::find_rq(1, "1.2.3", 0)))
            .await
            .unwrap();

        let mut stream = ReplyStream::new(
            peer.as_mut(),
            1,
            CommandField::CFindRsp,
            find_policy,
            Duration::from_millis(10),
            Duration::from_millis(10),
        );
        stream.next().await.unwrap();
        let err = stream.next().await.unwrap_err();
        assert!(matches!(err, DimseError::ConnectionLost(_)));
    }

    #[tokio::test]
    async fn wrong_command_is_rejected() {
        let mut peer = ScriptedPeer::new(vec![ScriptedStep::reply(CommandField::CMoveRsp, 0)])
            .into_channel(1);
        peer.send(DimseMessage::new(1, CommandSet::find_rq(1, "1.2.3", 0)))
            .await
            .unwrap();

        let mut stream = ReplyStream::new(
            peer.as_mut(),
            1,
            CommandField::CFindRsp,
            find_policy,
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        assert!(stream.next().await.is_err());
    }
}
