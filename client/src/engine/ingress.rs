use crate::{Error, Result};
use futures::{
    channel::{mpsc, oneshot},
    SinkExt,
};
use updraft_types::{Amount, Bet};

/// Messages sent to the engine.
pub enum Message {
    PlaceBet {
        amount: Amount,
        response: oneshot::Sender<Result<Bet>>,
    },
    CashOut {
        response: oneshot::Sender<Result<Bet>>,
    },
    Shutdown,
}

/// Handle for sending intents to the engine.
///
/// Clonable; dropping every clone tears the engine down, which releases its
/// timers and the snapshot poll.
#[derive(Clone)]
pub struct Mailbox {
    sender: mpsc::Sender<Message>,
}

impl Mailbox {
    pub(super) fn new(sender: mpsc::Sender<Message>) -> Self {
        Self { sender }
    }

    /// Stake `amount` on the current round. Resolves once the server
    /// accepted or refused; refusals surface as [`Error::Rejected`].
    pub async fn place_bet(&mut self, amount: Amount) -> Result<Bet> {
        let (response, receiver) = oneshot::channel();
        self.sender
            .send(Message::PlaceBet { amount, response })
            .await
            .map_err(|_| Error::EngineStopped)?;
        receiver.await.map_err(|_| Error::EngineStopped)?
    }

    /// Cash out the active bet at the server's current multiplier.
    pub async fn cash_out(&mut self) -> Result<Bet> {
        let (response, receiver) = oneshot::channel();
        self.sender
            .send(Message::CashOut { response })
            .await
            .map_err(|_| Error::EngineStopped)?;
        receiver.await.map_err(|_| Error::EngineStopped)?
    }

    /// Stop the engine. Idempotent; an already-stopped engine is fine.
    pub async fn shutdown(&mut self) {
        let _ = self.sender.send(Message::Shutdown).await;
    }
}
