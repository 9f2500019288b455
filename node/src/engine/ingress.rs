use futures::{
    channel::{mpsc, oneshot},
    SinkExt,
};
use liftoff_execution::{Cashout, GameError};
use liftoff_types::{Bet, Multiplier, UserId, Wei};
use thiserror::Error;
use tokio::sync::watch;

pub enum Message {
    PlaceBet {
        user: UserId,
        amount: Wei,
        auto_cashout: Option<Multiplier>,
        response: oneshot::Sender<Result<Bet, GameError>>,
    },
    CashOut {
        user: UserId,
        response: oneshot::Sender<Result<Cashout, GameError>>,
    },
}

#[derive(Debug, Error)]
pub enum MailboxError {
    #[error("engine mailbox closed")]
    Closed,
    #[error("engine request canceled")]
    Canceled,
    #[error("shutdown in progress")]
    ShuttingDown,
}

#[derive(Clone)]
pub struct Mailbox {
    sender: mpsc::Sender<Message>,
    stopped: watch::Receiver<bool>,
}

/// Resolves once shutdown is signaled (or the signal is dropped).
pub(super) async fn stopped(mut stopped: watch::Receiver<bool>) {
    while !*stopped.borrow_and_update() {
        if stopped.changed().await.is_err() {
            return;
        }
    }
}

impl Mailbox {
    pub(super) fn new(sender: mpsc::Sender<Message>, stopped: watch::Receiver<bool>) -> Self {
        Self { sender, stopped }
    }

    async fn request<T>(
        &self,
        message: Message,
        receiver: oneshot::Receiver<T>,
    ) -> Result<T, MailboxError> {
        {
            let mut sender = self.sender.clone();
            tokio::select! {
                result = sender.send(message) => {
                    result.map_err(|_| MailboxError::Closed)?;
                },
                _ = stopped(self.stopped.clone()) => {
                    return Err(MailboxError::ShuttingDown);
                },
            }
        }

        tokio::select! {
            result = receiver => {
                result.map_err(|_| MailboxError::Canceled)
            },
            _ = stopped(self.stopped.clone()) => {
                Err(MailboxError::ShuttingDown)
            },
        }
    }

    pub async fn place_bet(
        &self,
        user: UserId,
        amount: Wei,
        auto_cashout: Option<Multiplier>,
    ) -> Result<Result<Bet, GameError>, MailboxError> {
        let (response, receiver) = oneshot::channel();
        self.request(
            Message::PlaceBet {
                user,
                amount,
                auto_cashout,
                response,
            },
            receiver,
        )
        .await
    }

    pub async fn cash_out(&self, user: UserId) -> Result<Result<Cashout, GameError>, MailboxError> {
        let (response, receiver) = oneshot::channel();
        self.request(Message::CashOut { user, response }, receiver)
            .await
    }
}
