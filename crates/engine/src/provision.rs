//! Accepts requests before the handler exists. The first request starts
//! compilation; everything that arrives meanwhile is queued and replayed in
//! arrival order once the handler is ready. A queued request whose body is
//! still arriving is finished in the background instead of holding up the
//! rest of the queue.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::poll_immediate;
use runtime_core::{Fault, HandlerResponse, InboundRequest};
use tokio::sync::oneshot;

use crate::compiler::{CompileOptions, CompiledHandler, Compiler};
use crate::dispatch::{Dispatcher, fault_response};

pub type AssembleFn = Box<dyn FnOnce(CompiledHandler) -> Result<Dispatcher, Fault> + Send>;

/// How to produce the dispatcher once: compile `source`, then wrap the
/// result with `assemble`.
pub struct ProvisionPlan {
    pub compiler: Arc<dyn Compiler>,
    pub source: String,
    pub options: CompileOptions,
    pub assemble: AssembleFn,
}

struct Queued {
    request: InboundRequest,
    reply: oneshot::Sender<HandlerResponse>,
}

enum GateState {
    Unprovisioned,
    Provisioning { queue: VecDeque<Queued> },
    Ready(Arc<Dispatcher>),
    Failed(Fault),
}

enum Admission {
    Dispatch(Arc<Dispatcher>, InboundRequest),
    Rejected(Fault),
    Queued {
        reply: oneshot::Receiver<HandlerResponse>,
        provision: bool,
    },
}

pub struct ProvisioningGate {
    state: Mutex<GateState>,
    plan: Mutex<Option<ProvisionPlan>>,
}

impl ProvisioningGate {
    /// Gate around a handler that needs no provisioning.
    pub fn ready(dispatcher: Dispatcher) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(GateState::Ready(Arc::new(dispatcher))),
            plan: Mutex::new(None),
        })
    }

    pub fn pending(plan: ProvisionPlan) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(GateState::Unprovisioned),
            plan: Mutex::new(Some(plan)),
        })
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.lock_state(), GateState::Ready(_))
    }

    pub fn queued_len(&self) -> usize {
        match &*self.lock_state() {
            GateState::Provisioning { queue } => queue.len(),
            _ => 0,
        }
    }

    pub async fn handle(self: &Arc<Self>, request: InboundRequest) -> HandlerResponse {
        let admission = {
            let mut state = self.lock_state();
            match &mut *state {
                GateState::Ready(dispatcher) => Admission::Dispatch(Arc::clone(dispatcher), request),
                GateState::Failed(fault) => Admission::Rejected(fault.clone()),
                GateState::Provisioning { queue } => {
                    let (tx, rx) = oneshot::channel();
                    queue.push_back(Queued { request, reply: tx });
                    Admission::Queued {
                        reply: rx,
                        provision: false,
                    }
                }
                GateState::Unprovisioned => {
                    let (tx, rx) = oneshot::channel();
                    let queue = VecDeque::from([Queued { request, reply: tx }]);
                    *state = GateState::Provisioning { queue };
                    Admission::Queued {
                        reply: rx,
                        provision: true,
                    }
                }
            }
        };

        match admission {
            Admission::Dispatch(dispatcher, request) => dispatcher.dispatch(request).await,
            Admission::Rejected(fault) => fault_response(&fault),
            Admission::Queued { reply, provision } => {
                if provision {
                    let gate = Arc::clone(self);
                    tokio::spawn(async move { gate.provision().await });
                }
                match reply.await {
                    Ok(response) => response,
                    Err(_) => fault_response(&Fault::Server(
                        "Request was dropped while the handler was provisioned.".to_string(),
                    )),
                }
            }
        }
    }

    async fn provision(&self) {
        let plan = self
            .plan
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(plan) = plan else {
            return;
        };

        tracing::debug!("provisioning handler");
        let assembled = match plan.compiler.compile(&plan.source, &plan.options).await {
            Ok(compiled) => (plan.assemble)(compiled),
            Err(err) => Err(Fault::Compile(err)),
        };
        match assembled {
            Ok(dispatcher) => {
                self.replay(&Arc::new(dispatcher)).await;
                tracing::info!("handler ready");
            }
            Err(fault) => {
                tracing::error!("failed to provision handler: {}", fault);
                let previous = std::mem::replace(&mut *self.lock_state(), GateState::Failed(fault.clone()));
                if let GateState::Provisioning { queue } = previous {
                    for queued in queue {
                        let _ = queued.reply.send(fault_response(&fault));
                    }
                }
            }
        }
    }

    /// Starts queued requests in arrival order. The gate stays in
    /// `Provisioning` until the queue is empty so late arrivals cannot
    /// overtake earlier ones. Preparation is polled once in line; a request
    /// still waiting on its body continues in its own task and starts when
    /// the body is complete.
    async fn replay(&self, dispatcher: &Arc<Dispatcher>) {
        while let Some(Queued { request, reply }) = self.next_queued(dispatcher) {
            let owner = Arc::clone(dispatcher);
            let mut preparing = Box::pin(async move { owner.prepare(request).await });
            match poll_immediate(&mut preparing).await {
                Some(prepared) => {
                    let invocation = dispatcher.start(prepared);
                    tokio::spawn(async move {
                        let _ = reply.send(invocation.respond().await);
                    });
                }
                None => {
                    tracing::debug!("queued request body still arriving; finishing in background");
                    let dispatcher = Arc::clone(dispatcher);
                    tokio::spawn(async move {
                        let prepared = preparing.await;
                        let _ = reply.send(dispatcher.start(prepared).respond().await);
                    });
                }
            }
        }
    }

    fn next_queued(&self, dispatcher: &Arc<Dispatcher>) -> Option<Queued> {
        let mut state = self.lock_state();
        if let GateState::Provisioning { queue } = &mut *state {
            if let Some(queued) = queue.pop_front() {
                return Some(queued);
            }
        }
        *state = GateState::Ready(Arc::clone(dispatcher));
        None
    }

    fn lock_state(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ProvisioningGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.lock_state() {
            GateState::Unprovisioned => "unprovisioned",
            GateState::Provisioning { .. } => "provisioning",
            GateState::Ready(_) => "ready",
            GateState::Failed(_) => "failed",
        };
        f.debug_struct("ProvisioningGate")
            .field("state", &state)
            .finish_non_exhaustive()
    }
}
