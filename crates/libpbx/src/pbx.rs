use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, debug_span, error_span, info};

use crate::client_session;
use crate::spawn_utils::{spawn, spawn_with_cancel};
use crate::tu::{ClientTx, TelephoneUnit};
use crate::{Error, Result};

/// How many extensions a switch hands out unless configured otherwise.
pub const DEFAULT_MAX_EXTENSIONS: usize = 1024;

#[derive(Debug, Clone)]
pub struct ListenerOptions {
    pub listen_addr: SocketAddr,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            listen_addr: (Ipv4Addr::LOCALHOST, 0).into(),
        }
    }
}

#[derive(Default)]
pub struct PbxOptions {
    /// Where to accept telephone units. `None` runs the switch without a
    /// socket, driven through the registry API directly.
    pub listen: Option<ListenerOptions>,

    /// Size of the extension table. Defaults to [`DEFAULT_MAX_EXTENSIONS`].
    pub max_extensions: Option<usize>,

    pub cancellation_token: Option<CancellationToken>,
}

struct Registry {
    // Invariant: slots[ext], when occupied, holds the TU whose extension is
    // ext, and len counts the occupied slots.
    slots: Vec<Option<Arc<TelephoneUnit>>>,
    len: usize,
}

/// The switchboard: extension registry plus the accept loop feeding it.
///
/// The registry mutex is a leaf: it is never held while a TU lock is taken,
/// so it cannot participate in a cycle with the TU lock order.
pub struct Pbx {
    registry: Mutex<Registry>,
    // Signalled by unregister when the registry empties.
    drained: Notify,
    next_tu_id: AtomicU64,
    cancellation_token: CancellationToken,
    _cancellation_token_drop_guard: DropGuard,
    tcp_listen_addr: Option<SocketAddr>,
}

impl Pbx {
    pub async fn new_with_opts(opts: PbxOptions) -> anyhow::Result<Arc<Self>> {
        let token = opts.cancellation_token.unwrap_or_default();
        let max_extensions = opts.max_extensions.unwrap_or(DEFAULT_MAX_EXTENSIONS);
        anyhow::ensure!(
            max_extensions > 0 && max_extensions <= u16::MAX as usize + 1,
            "max_extensions must fit extension numbers, got {max_extensions}"
        );

        let listener = match opts.listen {
            Some(l) => {
                let listener = TcpListener::bind(l.listen_addr)
                    .await
                    .context("error starting TCP listener")?;
                let addr = listener
                    .local_addr()
                    .context("error getting listener addr")?;
                info!("listening on TCP {addr:?} for telephone units");
                Some((listener, addr))
            }
            None => None,
        };

        let pbx = Arc::new(Self {
            registry: Mutex::new(Registry {
                slots: vec![None; max_extensions],
                len: 0,
            }),
            drained: Notify::new(),
            next_tu_id: AtomicU64::new(0),
            cancellation_token: token.clone(),
            _cancellation_token_drop_guard: token.drop_guard(),
            tcp_listen_addr: listener.as_ref().map(|(_, addr)| *addr),
        });

        if let Some((listener, addr)) = listener {
            spawn_with_cancel(
                error_span!("pbx_listen", %addr),
                pbx.cancellation_token.clone(),
                pbx.clone().task_tcp_listener(listener),
            );
        }

        Ok(pbx)
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    /// The address the accept loop is bound to, if any. Useful with an
    /// ephemeral listen port.
    pub fn tcp_listen_addr(&self) -> Option<SocketAddr> {
        self.tcp_listen_addr
    }

    async fn task_tcp_listener(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await.context("error accepting")?;
            debug!(%addr, "accepted connection");
            let pbx = self.clone();
            spawn(debug_span!("client", %addr), async move {
                client_session::run(pbx, stream).await
            });
        }
    }

    /// Registers a new telephone unit on the lowest vacant extension and
    /// emits its initial ON HOOK notification.
    pub fn register(&self, tx: ClientTx) -> Result<Arc<TelephoneUnit>> {
        let mut registry = self.registry.lock();
        let ext = registry
            .slots
            .iter()
            .position(|slot| slot.is_none())
            .ok_or(Error::RegistryFull)?;
        Ok(self.insert(&mut registry, ext, tx))
    }

    /// Registers a new telephone unit on a specific extension.
    pub fn register_at(&self, tx: ClientTx, ext: u16) -> Result<Arc<TelephoneUnit>> {
        let mut registry = self.registry.lock();
        let slot = registry
            .slots
            .get(ext as usize)
            .ok_or(Error::ExtensionOutOfRange(ext))?;
        if slot.is_some() {
            return Err(Error::ExtensionOccupied(ext));
        }
        Ok(self.insert(&mut registry, ext as usize, tx))
    }

    fn insert(&self, registry: &mut Registry, ext: usize, tx: ClientTx) -> Arc<TelephoneUnit> {
        let id = self.next_tu_id.fetch_add(1, Ordering::Relaxed);
        // The TU is not reachable by any other task yet, so no TU lock is
        // involved while the registry lock is held.
        let tu = TelephoneUnit::new(id, ext as u16, tx);
        tu.notify_registered();
        registry.slots[ext] = Some(tu.clone());
        registry.len += 1;
        tu
    }

    /// Removes the registry's reference to this TU. Does not hang up; the
    /// caller drives the TU to on-hook first, which dissolves any pairing.
    pub fn unregister(&self, tu: &Arc<TelephoneUnit>) -> Result<()> {
        let mut registry = self.registry.lock();
        let slot = registry
            .slots
            .get_mut(tu.ext() as usize)
            .ok_or(Error::NotRegistered)?;
        match slot {
            Some(registered) if Arc::ptr_eq(registered, tu) => {
                *slot = None;
                registry.len -= 1;
                if registry.len == 0 {
                    self.drained.notify_waiters();
                }
                Ok(())
            }
            _ => Err(Error::NotRegistered),
        }
    }

    pub fn registered_count(&self) -> usize {
        self.registry.lock().len
    }

    /// Resolves `ext` and dials it on behalf of `tu`. Missing, out-of-range
    /// and vacant extensions all dial a null target, which the TU reports as
    /// an error.
    pub fn dial_ext(&self, tu: &Arc<TelephoneUnit>, ext: Option<u16>) {
        let target = {
            let registry = self.registry.lock();
            ext.and_then(|e| registry.slots.get(e as usize).cloned().flatten())
        };
        tu.dial(target);
    }

    /// Initiates orderly shutdown and waits for every session to drain: the
    /// accept loop dies with the token, sessions observe it, hang up their
    /// TUs (tearing down live calls) and unregister.
    pub async fn stop(&self) {
        self.cancellation_token.cancel();
        loop {
            if self.registered_count() == 0 {
                return;
            }
            let drained = self.drained.notified();
            tokio::pin!(drained);
            // Arm before re-checking so an unregister that lands between the
            // check and the await is not missed.
            drained.as_mut().enable();
            if self.registered_count() == 0 {
                return;
            }
            drained.await;
        }
    }
}
