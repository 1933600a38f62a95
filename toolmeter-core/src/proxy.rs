//! Forward-proxy path: gate the virtual key, call the upstream, then
//! synthesize and persist spans for the exchange.

use std::sync::Arc;

use chrono::Utc;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::Instrument;

use crate::attribution::Attribution;
use crate::budget::{BudgetGate, VirtualKey};
use crate::error::{CoreResult, MeterError};
use crate::http_client::SseStream;
use crate::ingest::IngestEngine;
use crate::model::{ChatRequest, ChatResponse};
use crate::provider::ChatProvider;
use crate::provider_factory::ProviderRegistry;
use crate::router::RoutingResolver;
use crate::store::PersistReceipt;
use crate::stream::DeltaAccumulator;
use crate::synth::{CompletionExchange, ExchangeOutcome, SpanSynthesizer};

/// Buffered lines between the upstream reader and the client.
const CLIENT_BUFFER: usize = 64;

/// One inbound proxy request.
#[derive(Debug, Clone)]
pub struct ProxyCall {
    pub key: VirtualKey,
    /// Explicit upstream; routing rules apply when absent.
    pub provider: Option<String>,
    pub request: ChatRequest,
}

/// A streamed completion: lines for the client plus the handle of the task
/// that keeps draining the upstream and records the exchange.
pub struct ProxiedStream {
    pub lines: SseStream,
    pub recorded: JoinHandle<CoreResult<PersistReceipt>>,
}

#[derive(Clone)]
pub struct CompletionProxy {
    engine: Arc<IngestEngine>,
    synth: Arc<SpanSynthesizer>,
    registry: Arc<ProviderRegistry>,
    router: Arc<RoutingResolver>,
}

fn attribution_of(key: &VirtualKey) -> Attribution {
    Attribution {
        tenant_id: key.tenant_id.clone(),
        user_id: key.user_id.clone(),
        team_id: key.team_id.clone(),
    }
}

fn failed(err: &MeterError, partial: Option<ChatResponse>) -> ExchangeOutcome {
    let (status, message) = err
        .upstream_detail()
        .unwrap_or_else(|| (None, err.to_string()));
    ExchangeOutcome::Failed {
        status,
        message,
        partial,
    }
}

impl CompletionProxy {
    pub fn new(
        engine: Arc<IngestEngine>,
        synth: Arc<SpanSynthesizer>,
        registry: Arc<ProviderRegistry>,
        router: Arc<RoutingResolver>,
    ) -> Self {
        Self {
            engine,
            synth,
            registry,
            router,
        }
    }

    /// Budget gate, model allow-list and provider selection. Nothing here
    /// touches the upstream.
    fn admit(&self, call: &ProxyCall) -> CoreResult<Arc<dyn ChatProvider>> {
        let decision = BudgetGate::authorize(&call.key, &call.request.model, Utc::now())
            .inspect_err(|e| {
                tracing::info!(key_id = %call.key.id, model = %call.request.model, error = %e, "proxy call rejected");
            })?;
        tracing::debug!(key_id = %call.key.id, state = ?decision.state, remaining_usd = ?decision.remaining_usd, "key admitted");
        self.router
            .select_chat(&self.registry, call.provider.as_deref(), &call.request.model)
    }

    async fn record(&self, attribution: &Attribution, ex: CompletionExchange) -> CoreResult<PersistReceipt> {
        self.synth
            .record(&self.engine, attribution, &ex)
            .await
            .inspect_err(|e| {
                tracing::error!(tenant_id = %attribution.tenant_id, error = %e, "exchange not recorded");
            })
    }

    /// Buffered completion. The upstream call and the record step run in a
    /// spawned task, so a caller that goes away mid-call still leaves a
    /// recorded exchange behind.
    #[tracing::instrument(skip_all, fields(key_id = %call.key.id, model = %call.request.model))]
    pub async fn complete(&self, call: ProxyCall) -> CoreResult<ChatResponse> {
        let provider = self.admit(&call)?;
        let this = self.clone();
        tokio::spawn(async move { this.run_buffered(provider, call).await }.in_current_span())
            .await
            .map_err(|e| MeterError::Other(anyhow::anyhow!("completion task failed: {e}")))?
    }

    /// An upstream error wins over a record failure; otherwise a record
    /// failure is returned in place of the response.
    async fn run_buffered(&self, provider: Arc<dyn ChatProvider>, call: ProxyCall) -> CoreResult<ChatResponse> {
        let attribution = attribution_of(&call.key);

        let started_at = Utc::now();
        let result = provider.chat(call.request.clone()).await;
        let finished_at = Utc::now();

        let outcome = match &result {
            Ok(response) => ExchangeOutcome::Completed {
                status: 200,
                response: response.clone(),
            },
            Err(e) => failed(e, None),
        };
        let ex = CompletionExchange {
            provider: provider.name().to_string(),
            request: call.request,
            outcome,
            started_at,
            finished_at,
        };
        let recorded = self.record(&attribution, ex).await;
        let response = result?;
        recorded?;
        Ok(response)
    }

    /// Start a streamed completion. A single spawned task reads the upstream,
    /// forwards each line and feeds the accumulator; it keeps draining after
    /// the client goes away and records the exchange at the end. A record
    /// failure reaches the client as a final `Err` item and `recorded`.
    #[tracing::instrument(skip_all, fields(key_id = %call.key.id, model = %call.request.model))]
    pub async fn complete_stream(&self, call: ProxyCall) -> CoreResult<ProxiedStream> {
        let provider = self.admit(&call)?;
        let attribution = attribution_of(&call.key);
        let provider_name = provider.name().to_string();

        let started_at = Utc::now();
        let mut upstream = match provider.chat_stream(call.request.clone()).await {
            Ok(s) => s,
            Err(e) => {
                let ex = CompletionExchange {
                    provider: provider_name,
                    request: call.request,
                    outcome: failed(&e, None),
                    started_at,
                    finished_at: Utc::now(),
                };
                // The upstream error is what the caller needs; a record
                // failure on top of it is only logged.
                let _ = self.record(&attribution, ex).await;
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::channel(CLIENT_BUFFER);
        let this = self.clone();
        let recorded = tokio::spawn(
            async move {
                let mut acc = DeltaAccumulator::new();
                let mut client_open = true;
                let mut failure: Option<MeterError> = None;

                while let Some(item) = upstream.next().await {
                    match item {
                        Ok(line) => {
                            acc.push_line(&line.line);
                            if client_open && tx.send(Ok(line)).await.is_err() {
                                tracing::debug!("client went away; draining upstream");
                                client_open = false;
                            }
                        }
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    }
                }

                let model = call.request.model.clone();
                let outcome = match failure {
                    Some(e) => {
                        let partial = acc.has_output().then(|| acc.finish(&model));
                        let outcome = failed(&e, partial);
                        if client_open && tx.send(Err(e)).await.is_err() {
                            client_open = false;
                        }
                        outcome
                    }
                    None if !acc.saw_done() => ExchangeOutcome::Failed {
                        status: None,
                        message: "stream ended before [DONE]".into(),
                        partial: acc.has_output().then(|| acc.finish(&model)),
                    },
                    None => {
                        if acc.skipped_frames() > 0 {
                            tracing::debug!(skipped = acc.skipped_frames(), "malformed frames skipped");
                        }
                        ExchangeOutcome::Completed {
                            status: 200,
                            response: acc.finish(&model),
                        }
                    }
                };

                let ex = CompletionExchange {
                    provider: provider_name,
                    request: call.request,
                    outcome,
                    started_at,
                    finished_at: Utc::now(),
                };
                let receipt = this.record(&attribution, ex).await;
                if let Err(e) = &receipt
                    && client_open
                {
                    let _ = tx
                        .send(Err(MeterError::Other(anyhow::anyhow!("exchange not recorded: {e}"))))
                        .await;
                }
                receipt
            }
            .in_current_span(),
        );

        Ok(ProxiedStream {
            lines: Box::pin(ReceiverStream::new(rx)),
            recorded,
        })
    }
}
