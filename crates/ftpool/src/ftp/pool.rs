//! Connection pool — a bounded set of control channels to one host.
//!
//! Capacity is a `tokio::sync::Semaphore` with one permit per allowed
//! channel; a permit is held for as long as a channel is checked out.
//! Bookkeeping (idle set, live count, counters) sits behind a
//! `std::sync::Mutex` that is never held across an `.await`.

use crate::ftp::channel::ControlChannel;
use crate::ftp::config::SessionConfig;
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::tls;
use crate::ftp::types::PoolStats;
use rustls::ClientConfig;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;

struct IdleChannel {
    channel: ControlChannel,
    since: Instant,
}

#[derive(Default)]
struct PoolState {
    idle: Vec<IdleChannel>,
    /// Open channels plus channels being opened.
    live: usize,
    in_use: usize,
    closed: bool,
    opened_total: u64,
    retired_total: u64,
}

/// Bounded pool of control channels for a single server.
pub struct ConnectionPool {
    config: Arc<SessionConfig>,
    tls: Option<Arc<ClientConfig>>,
    permits: Arc<Semaphore>,
    state: Mutex<PoolState>,
}

impl ConnectionPool {
    /// Create an empty pool. No connection is opened here.
    pub fn new(config: Arc<SessionConfig>) -> FtpResult<Arc<Self>> {
        let tls = match config.tls {
            Some(ref tls_config) => Some(tls::build_client_config(tls_config)?),
            None => None,
        };
        Ok(Arc::new(Self {
            permits: Arc::new(Semaphore::new(config.connections_per_host)),
            config,
            tls,
            state: Mutex::new(PoolState::default()),
        }))
    }

    pub fn config(&self) -> &Arc<SessionConfig> {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Check out a channel: an idle one if available, otherwise a new one
    /// while under the limit, otherwise wait up to the pool timeout.
    pub async fn acquire(self: &Arc<Self>) -> FtpResult<PooledChannel> {
        if self.lock().closed {
            return Err(self.closed_error());
        }

        let permit = match timeout(
            self.config.pool_timeout,
            Arc::clone(&self.permits).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(self.closed_error()),
            Err(_) => {
                return Err(FtpError::pool_exhausted(format!(
                    "No control channel available within {:?} (max {})",
                    self.config.pool_timeout, self.config.connections_per_host
                ))
                .with_host(self.config.address()))
            }
        };

        // The reservation undoes the bookkeeping if this future is dropped
        // or the open fails.
        let mut reservation = Reservation::new(self);

        loop {
            let idle = {
                let mut st = self.lock();
                if st.closed {
                    return Err(self.closed_error());
                }
                st.idle.pop()
            };

            let channel = match idle {
                Some(entry) => {
                    reservation.reuse();
                    match self.revalidate(entry).await {
                        Ok(channel) => {
                            log::debug!("[{}] reusing idle channel", channel.id());
                            channel
                        }
                        Err(e) => {
                            log::debug!("stale idle channel dropped: {}", e);
                            reservation.discard();
                            continue;
                        }
                    }
                }
                None => {
                    reservation.open();
                    let channel =
                        ControlChannel::connect(Arc::clone(&self.config), self.tls.clone()).await?;
                    self.lock().opened_total += 1;
                    log::debug!(
                        "[{}] opened new channel to {}",
                        channel.id(),
                        self.config.address()
                    );
                    channel
                }
            };

            reservation.commit();
            return Ok(PooledChannel {
                channel: Some(channel),
                pool: Arc::clone(self),
                _permit: permit,
            });
        }
    }

    /// Send NOOP on a channel that sat idle longer than the timeout.
    async fn revalidate(&self, entry: IdleChannel) -> FtpResult<ControlChannel> {
        let mut channel = entry.channel;
        if entry.since.elapsed() >= self.config.timeout {
            channel.expect("NOOP", |c| (200..300).contains(&c)).await?;
        }
        Ok(channel)
    }

    /// Return a channel. Unhealthy channels are dropped without QUIT.
    fn give_back(&self, mut channel: ControlChannel, healthy: bool) {
        let healthy = healthy && channel.is_ready();
        let mut st = self.lock();
        st.in_use -= 1;

        if healthy && !st.closed {
            st.idle.push(IdleChannel {
                channel,
                since: Instant::now(),
            });
            return;
        }

        st.live -= 1;
        let closed = st.closed;
        if !healthy {
            st.retired_total += 1;
        }
        drop(st);

        if healthy && closed {
            // Pool shut down while this channel was out: say goodbye.
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(channel.quit());
            }
        } else {
            log::debug!("[{}] retiring channel", channel.id());
            channel.poison();
        }
    }

    /// Occupancy snapshot.
    pub fn stats(&self) -> PoolStats {
        let st = self.lock();
        PoolStats {
            live: st.live,
            idle: st.idle.len(),
            in_use: st.in_use,
            max: self.config.connections_per_host,
            opened_total: st.opened_total,
            retired_total: st.retired_total,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// QUIT every idle channel and refuse further acquisitions.
    /// Checked-out channels are closed as they come back.
    pub async fn close(&self) {
        let idle = {
            let mut st = self.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            let idle_count = st.idle.len();
            st.live -= idle_count;
            std::mem::take(&mut st.idle)
        };
        self.permits.close();

        let count = idle.len();
        for entry in idle {
            entry.channel.quit().await;
        }
        log::info!(
            "FTP pool for {} closed ({} idle channels quit)",
            self.config.address(),
            count
        );
    }

    fn closed_error(&self) -> FtpError {
        FtpError::not_ready("Connection pool is closed").with_host(self.config.address())
    }
}

/// Bookkeeping for one in-flight `acquire`.
///
/// Dropping an uncommitted reservation (cancelled future, failed open)
/// gives back the `in_use` slot and whatever live slot it held.
struct Reservation<'a> {
    pool: &'a ConnectionPool,
    slot: Slot,
    committed: bool,
}

/// The live channel a reservation is responsible for, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Empty,
    /// A new channel is being connected; not yet in `opened_total`.
    Opening,
    /// An idle channel was taken off the stack.
    Reused,
}

impl<'a> Reservation<'a> {
    fn new(pool: &'a ConnectionPool) -> Self {
        pool.lock().in_use += 1;
        Self {
            pool,
            slot: Slot::Empty,
            committed: false,
        }
    }

    fn open(&mut self) {
        self.pool.lock().live += 1;
        self.slot = Slot::Opening;
    }

    /// Take responsibility for a popped idle channel, already counted live.
    fn reuse(&mut self) {
        self.slot = Slot::Reused;
    }

    /// The reused channel failed revalidation and is gone.
    fn discard(&mut self) {
        let pool = self.pool;
        self.retire_slot(&mut pool.lock());
    }

    fn retire_slot(&mut self, st: &mut PoolState) {
        match self.slot {
            Slot::Empty => {}
            Slot::Opening => st.live -= 1,
            Slot::Reused => {
                st.live -= 1;
                st.retired_total += 1;
            }
        }
        self.slot = Slot::Empty;
    }

    fn commit(&mut self) {
        self.committed = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let pool = self.pool;
        let mut st = pool.lock();
        st.in_use -= 1;
        self.retire_slot(&mut st);
    }
}

/// A control channel checked out of the pool.
///
/// Return it with [`PooledChannel::release`]. Dropping it without a release
/// (e.g. a cancelled operation) retires the channel.
pub struct PooledChannel {
    channel: Option<ControlChannel>,
    pool: Arc<ConnectionPool>,
    _permit: OwnedSemaphorePermit,
}

impl PooledChannel {
    /// The checked-out channel.
    pub fn channel(&mut self) -> FtpResult<&mut ControlChannel> {
        self.channel
            .as_mut()
            .ok_or_else(|| FtpError::not_ready("Channel already released"))
    }

    /// Hand the channel back; `healthy == false` retires it.
    pub fn release(mut self, healthy: bool) {
        if let Some(channel) = self.channel.take() {
            self.pool.give_back(channel, healthy);
        }
    }
}

impl std::fmt::Debug for PooledChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledChannel")
            .field("channel", &self.channel)
            .finish()
    }
}

impl Drop for PooledChannel {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.take() {
            log::debug!("[{}] dropped without release", channel.id());
            self.pool.give_back(channel, false);
        }
    }
}
