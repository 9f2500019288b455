use crate::{Error, Result};
use futures_util::{SinkExt, Stream as FutStream, StreamExt};
use liftoff_types::{
    api::{CashOut, Heartbeat, Hello, PlaceBet, Reply, Withdraw},
    ClientMessage, Envelope, Event, Multiplier, Wei,
};
use std::collections::VecDeque;
use tokio::sync::mpsc;
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};
use tracing::{debug, error};

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// A realtime connection: server envelopes in, client messages out.
pub struct Stream {
    receiver: mpsc::Receiver<Result<Envelope>>,
    outbound: mpsc::Sender<Message>,
    /// Envelopes read past while waiting for a reply.
    pending: VecDeque<Envelope>,
    last_event_id: Option<u64>,
    reader: tokio::task::JoinHandle<()>,
    writer: tokio::task::JoinHandle<()>,
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

impl Stream {
    pub(crate) fn new_with_capacity<S>(ws: WebSocketStream<S>, capacity: usize) -> Self
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let capacity = if capacity == 0 {
            DEFAULT_CHANNEL_CAPACITY
        } else {
            capacity
        };
        let (mut sink, mut source) = ws.split();
        let (tx, rx) = mpsc::channel(capacity);
        let (outbound, mut queued) = mpsc::channel::<Message>(capacity);

        let reader = tokio::spawn(async move {
            while let Some(msg) = source.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        let decoded = Envelope::decode(&text).map_err(|e| {
                            error!("Failed to decode envelope: {}", e);
                            Error::from(e)
                        });
                        if tx.send(decoded).await.is_err() {
                            break; // Receiver dropped
                        }
                    }
                    Ok(Message::Close(_)) => {
                        debug!("WebSocket closed");
                        let _ = tx.send(Err(Error::ConnectionClosed)).await;
                        break;
                    }
                    Ok(_) => {} // Ignore other message types
                    Err(e) => {
                        error!("WebSocket error: {}", e);
                        let _ = tx.send(Err(e.into())).await;
                        break;
                    }
                }
            }
        });

        let writer = tokio::spawn(async move {
            while let Some(message) = queued.recv().await {
                if let Err(e) = sink.send(message).await {
                    debug!("Failed to send message: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        Self {
            receiver: rx,
            outbound,
            pending: VecDeque::new(),
            last_event_id: None,
            reader,
            writer,
        }
    }

    /// Id of the last sequenced event handed out, for resuming after a reconnect.
    pub fn last_event_id(&self) -> Option<u64> {
        self.last_event_id
    }

    fn observe(&mut self, envelope: &Envelope) {
        match &envelope.event {
            Event::Snapshot(snapshot) => self.last_event_id = Some(snapshot.last_event_id),
            _ if envelope.is_sequenced() => self.last_event_id = Some(envelope.id),
            _ => {}
        }
    }

    /// Receive the next envelope from the stream
    pub async fn next(&mut self) -> Option<Result<Envelope>> {
        let next = match self.pending.pop_front() {
            Some(envelope) => Some(Ok(envelope)),
            None => self.receiver.recv().await,
        };
        if let Some(Ok(envelope)) = &next {
            self.observe(envelope);
        }
        next
    }

    /// Queue a message for the server.
    pub async fn send(&self, message: &ClientMessage) -> Result<()> {
        let text = serde_json::to_string(message)?;
        self.outbound
            .send(Message::Text(text))
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Send a request and wait for its reply. Events that arrive first stay queued for
    /// [Stream::next].
    pub async fn request(&mut self, message: ClientMessage) -> Result<Reply> {
        let request = message.name();
        self.send(&message).await?;
        loop {
            let envelope = match self.receiver.recv().await {
                Some(envelope) => envelope?,
                None => return Err(Error::ConnectionClosed),
            };
            match envelope.event {
                Event::Reply(reply) if reply.request == request => {
                    if reply.ok {
                        return Ok(reply);
                    }
                    return Err(Error::Rejected {
                        request: reply.request,
                        code: reply.code.unwrap_or_default(),
                        message: reply.message.unwrap_or_default(),
                    });
                }
                _ => self.pending.push_back(envelope),
            }
        }
    }

    pub async fn hello(&self, last_event_id: Option<u64>) -> Result<()> {
        self.send(&ClientMessage::Hello(Hello { last_event_id }))
            .await
    }

    pub async fn place_bet(&mut self, amount: Wei, auto_cashout: Option<Multiplier>) -> Result<()> {
        self.request(ClientMessage::PlaceBet(PlaceBet {
            amount,
            auto_cashout,
        }))
        .await
        .map(|_| ())
    }

    pub async fn cash_out(&mut self) -> Result<()> {
        self.request(ClientMessage::CashOut(CashOut {}))
            .await
            .map(|_| ())
    }

    pub async fn heartbeat(&mut self) -> Result<()> {
        self.request(ClientMessage::Heartbeat(Heartbeat {}))
            .await
            .map(|_| ())
    }

    /// Request a withdrawal. Returns the payout id.
    pub async fn withdraw(&mut self, to: &str, amount: Wei) -> Result<String> {
        let reply = self
            .request(ClientMessage::Withdraw(Withdraw {
                amount,
                to: to.to_string(),
            }))
            .await?;
        reply.message.ok_or(Error::UnexpectedResponse)
    }
}

impl FutStream for Stream {
    type Item = Result<Envelope>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        let next = match self.pending.pop_front() {
            Some(envelope) => std::task::Poll::Ready(Some(Ok(envelope))),
            None => self.receiver.poll_recv(cx),
        };
        if let std::task::Poll::Ready(Some(Ok(envelope))) = &next {
            self.observe(envelope);
        }
        next
    }
}
