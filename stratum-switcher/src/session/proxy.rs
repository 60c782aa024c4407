//! Proxy mode: the two copiers, the coin watcher and reconnection.

use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::sync::CancellationToken;

use super::{
    read_line, RunningState, Session, CLIENT_DRAIN_TIMEOUT, RECONNECT_RETRY_DELAY,
    RECONNECT_RETRY_TIMES, WATCH_RETRY_DELAY,
};
use crate::error::{Error, Result};
use crate::tracing::prelude::*;

/// Why a copier stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CopyEnd {
    /// The generation was cancelled; someone else is acting.
    Cancelled,
    ClientFailed,
    ServerFailed,
}

/// Outcome of writing one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteEnd {
    Done,
    Cancelled(usize),
    Failed(usize),
}

/// Write `data`, giving up when `generation` is cancelled. Reports how many
/// bytes made it out.
async fn write_or_cancel(
    writer: &mut OwnedWriteHalf,
    data: &[u8],
    generation: &CancellationToken,
) -> WriteEnd {
    let mut written = 0;
    while written < data.len() {
        tokio::select! {
            _ = generation.cancelled() => return WriteEnd::Cancelled(written),
            result = writer.write(&data[written..]) => match result {
                Ok(0) | Err(_) => return WriteEnd::Failed(written),
                Ok(n) => written += n,
            },
        }
    }
    WriteEnd::Done
}

impl Session {
    /// Start the copiers and the coin watcher for the current generation.
    pub(super) fn enter_proxy(self: &Arc<Self>) {
        let (seen, generation) = {
            let state = self.state.lock();
            (state.reconnect_counter, state.generation.clone())
        };
        self.ctx.registry.register(self.clone());
        trace!(session = %self.id_hex, generation = seen, "Entering proxy mode.");

        let session = self.clone();
        let token = generation.clone();
        self.ctx
            .tasks
            .spawn(async move { session.copy_downstream(seen, token).await });

        let session = self.clone();
        let token = generation.clone();
        self.ctx
            .tasks
            .spawn(async move { session.copy_upstream(seen, token).await });

        let session = self.clone();
        self.ctx
            .tasks
            .spawn(async move { session.watch_coin(seen, generation).await });
    }

    /// Server to client.
    async fn copy_downstream(self: Arc<Self>, seen: u32, generation: CancellationToken) {
        let end = {
            let mut reader = self.server_reader.lock().await;
            let mut writer = self.client_writer.lock().await;
            let (Some(reader), Some(writer)) = (reader.as_mut(), writer.as_mut()) else {
                return;
            };

            loop {
                let chunk = tokio::select! {
                    _ = generation.cancelled() => break CopyEnd::Cancelled,
                    read = reader.fill_buf() => match read {
                        Ok([]) | Err(_) => break CopyEnd::ServerFailed,
                        Ok(buf) => buf.to_vec(),
                    },
                };

                let outcome = write_or_cancel(writer, &chunk, &generation).await;
                let written = match outcome {
                    WriteEnd::Done => chunk.len(),
                    WriteEnd::Cancelled(n) | WriteEnd::Failed(n) => n,
                };
                // The unwritten tail stays buffered for reconnect or detach.
                reader.consume(written);
                self.note_client_write(&chunk[..written]);

                match outcome {
                    WriteEnd::Done => {}
                    WriteEnd::Cancelled(_) => break CopyEnd::Cancelled,
                    WriteEnd::Failed(_) => break CopyEnd::ClientFailed,
                }
            }
        };

        trace!(session = %self.id_hex, ?end, "Downstream copier finished.");
        self.copier_ended(seen, end);
    }

    /// Client to server.
    async fn copy_upstream(self: Arc<Self>, seen: u32, generation: CancellationToken) {
        let end = {
            let mut inbound = self.client_inbound.lock().await;
            let mut writer = self.server_writer.lock().await;
            let (Some(inbound), Some(writer)) = (inbound.as_mut(), writer.as_mut()) else {
                return;
            };

            let mut chunk = inbound.take_for_new_server().to_vec();
            loop {
                if !chunk.is_empty() {
                    let outcome = write_or_cancel(writer, &chunk, &generation).await;
                    let written = match outcome {
                        WriteEnd::Done => chunk.len(),
                        WriteEnd::Cancelled(n) | WriteEnd::Failed(n) => n,
                    };
                    inbound.line.delivered(&chunk[..written]);
                    inbound.unsent.extend_from_slice(&chunk[written..]);

                    match outcome {
                        WriteEnd::Done => {}
                        WriteEnd::Cancelled(_) => break CopyEnd::Cancelled,
                        WriteEnd::Failed(_) => break CopyEnd::ServerFailed,
                    }
                }

                chunk = tokio::select! {
                    _ = generation.cancelled() => break CopyEnd::Cancelled,
                    read = inbound.reader.fill_buf() => match read {
                        Ok([]) | Err(_) => break CopyEnd::ClientFailed,
                        Ok(buf) => buf.to_vec(),
                    },
                };
                inbound.reader.consume(chunk.len());
            }
        };

        trace!(session = %self.id_hex, ?end, "Upstream copier finished.");
        self.copier_ended(seen, end);
    }

    fn copier_ended(self: &Arc<Self>, seen: u32, end: CopyEnd) {
        match end {
            CopyEnd::Cancelled => {}
            CopyEnd::ServerFailed if !self.is_agent() => {
                warn!(session = %self.id_hex, coin = %self.mining_coin(), "Server connection lost.");
                self.try_reconnect(seen);
            }
            CopyEnd::ServerFailed | CopyEnd::ClientFailed => self.try_stop(seen),
        }
    }

    /// Follow the subaccount's coin key and act on changes.
    async fn watch_coin(self: Arc<Self>, seen: u32, generation: CancellationToken) {
        let Some(path) = self.watch_path() else {
            return;
        };

        loop {
            let read = tokio::select! {
                _ = generation.cancelled() => return,
                read = self.ctx.watch.get_and_watch(&path, self.id) => read,
            };

            let changed = match read {
                Ok((value, changed)) => {
                    let coin = String::from_utf8_lossy(&value).trim().to_string();
                    if coin != self.mining_coin() {
                        if !self.ctx.config.stratum_servers.contains_key(&coin) {
                            warn!(
                                session = %self.id_hex,
                                worker = %self.worker_label(),
                                %coin,
                                "Assigned coin has no stratum server; staying."
                            );
                        } else if self.is_agent() {
                            info!(
                                session = %self.id_hex,
                                %coin,
                                "Coin changed for agent session; disconnecting."
                            );
                            self.try_stop(seen);
                            return;
                        } else {
                            self.switch_coin_type(seen, coin);
                            return;
                        }
                    }
                    changed
                }
                Err(e) => {
                    warn!(session = %self.id_hex, %path, error = %e, "Reading coin assignment failed.");
                    tokio::select! {
                        _ = generation.cancelled() => return,
                        _ = tokio::time::sleep(WATCH_RETRY_DELAY) => {}
                    }
                    continue;
                }
            };

            tokio::select! {
                _ = generation.cancelled() => return,
                event = changed => {
                    if let Ok(event) = event {
                        trace!(session = %self.id_hex, %event, "Coin assignment event.");
                    }
                }
            }
        }
    }

    /// Leave `Running` for `Reconnecting` if still in generation `seen`,
    /// optionally moving to `new_coin`. Returns the coin mined before.
    fn begin_reconnect(&self, seen: u32, new_coin: Option<String>) -> Option<String> {
        let mut state = self.state.lock();
        if state.running != RunningState::Running || state.reconnect_counter != seen {
            return None;
        }
        state.running = RunningState::Reconnecting;
        state.reconnect_counter += 1;
        state.generation.cancel();

        let previous = state.mining_coin.clone();
        if let Some(coin) = new_coin {
            state.mining_coin = coin;
        }
        Some(previous)
    }

    /// Reconnect to the current coin's server after a server failure.
    pub(crate) fn try_reconnect(self: &Arc<Self>, seen: u32) {
        if self.begin_reconnect(seen, None).is_none() {
            return;
        }
        let session = self.clone();
        self.ctx
            .tasks
            .spawn(async move { session.reconnect_server(true, None).await });
    }

    /// Move the session to `coin`'s server.
    pub(crate) fn switch_coin_type(self: &Arc<Self>, seen: u32, coin: String) {
        let Some(previous) = self.begin_reconnect(seen, Some(coin.clone())) else {
            return;
        };
        info!(
            session = %self.id_hex,
            worker = %self.worker_label(),
            from = %previous,
            to = %coin,
            "Switching coin."
        );
        let session = self.clone();
        self.ctx
            .tasks
            .spawn(async move { session.reconnect_server(false, Some(previous)).await });
    }

    /// Replace the server connection, keeping the client's.
    ///
    /// With `drain`, bytes already read from the old server reach the client
    /// first. Messages from a different coin's server would only confuse
    /// it, so a coin switch discards them. Either way a line the client got
    /// the start of is finished from the old server if it can be.
    /// `fallback` is the coin to return to if the new one cannot be signed
    /// up with.
    async fn reconnect_server(self: Arc<Self>, drain: bool, mut fallback: Option<String>) {
        self.ctx.registry.unregister(self.id);
        self.release_watch();

        let reader = self.server_reader.lock().await.take();
        if let Some(mut reader) = reader {
            if let Err(e) = self.flush_old_server(&mut reader, drain).await {
                debug!(session = %self.id_hex, error = %e, "Flushing old server bytes failed.");
            }
        }
        drop(self.server_writer.lock().await.take());

        loop {
            match self.connect_with_retries().await {
                Ok(()) => break,
                Err(Error::NotRunning) => {
                    self.stop();
                    return;
                }
                Err(e) => {
                    if let Some(previous) = fallback.take() {
                        warn!(
                            session = %self.id_hex,
                            failed = %self.mining_coin(),
                            back_to = %previous,
                            error = %e,
                            "Coin switch failed; reverting."
                        );
                        self.state.lock().mining_coin = previous;
                        continue;
                    }
                    error!(session = %self.id_hex, coin = %self.mining_coin(), error = %e, "Reconnect failed.");
                    self.stop();
                    return;
                }
            }
        }

        {
            let mut state = self.state.lock();
            if state.running != RunningState::Reconnecting {
                return;
            }
            state.running = RunningState::Running;
            state.generation = self.shutdown.child_token();
        }
        info!(
            session = %self.id_hex,
            worker = %self.worker_label(),
            coin = %self.mining_coin(),
            "Reconnected."
        );
        self.enter_proxy();
    }

    /// Pass on what the old server sent that the client still needs.
    async fn flush_old_server(
        &self,
        reader: &mut BufReader<OwnedReadHalf>,
        drain: bool,
    ) -> Result<()> {
        if drain && !reader.buffer().is_empty() {
            let buffered = reader.buffer().to_vec();
            reader.consume(buffered.len());
            self.flush_to_client(&buffered).await?;
        }
        if self.client_mid_line() {
            let rest = tokio::time::timeout(CLIENT_DRAIN_TIMEOUT, read_line(reader, "server"))
                .await
                .map_err(|_| Error::Timeout("server line"))??;
            self.flush_to_client(&rest).await?;
        }
        Ok(())
    }

    async fn connect_with_retries(&self) -> Result<()> {
        let mut last = Error::NotRunning;
        for attempt in 0..=RECONNECT_RETRY_TIMES {
            if attempt > 0 {
                self.pause(RECONNECT_RETRY_DELAY).await?;
            }
            let connected = tokio::select! {
                _ = self.shutdown.cancelled() => return Err(Error::NotRunning),
                result = self.connect_stratum_server(true) => result,
            };
            match connected {
                Ok(()) => return Ok(()),
                Err(Error::NotRunning) => return Err(Error::NotRunning),
                Err(e) => {
                    warn!(session = %self.id_hex, attempt, error = %e, "Connect stratum server failed.");
                    last = e;
                }
            }
        }
        Err(last)
    }
}
