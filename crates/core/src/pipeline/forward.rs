use super::runner::Control;
use crate::{
    floor::GenerationGate,
    stage::{StageError, StageKind, StageStream, SynthesisOutput},
    transport::MediaEvent,
    turn::Generation,
};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Forwards synthesizer output to the transport in arrival order.
///
/// Audio whose generation is no longer current is dropped here, so nothing
/// from an interrupted response reaches the client after the gate advances.
/// The first frame of each generation and its `Done` marker are reported on
/// `control`.
pub(super) async fn forward_synthesis(
    mut output: StageStream<SynthesisOutput>,
    gate: GenerationGate,
    outbound: mpsc::Sender<MediaEvent>,
    control: mpsc::Sender<Control>,
    cancel: CancellationToken,
) {
    let mut started: Option<Generation> = None;
    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            item = output.next() => item,
        };
        match item {
            Some(Ok(SynthesisOutput::Audio(tagged))) => {
                let generation = tagged.generation;
                if !gate.is_current(generation) {
                    trace!(%generation, "Dropping stale synthesized audio");
                    continue;
                }
                if started != Some(generation) {
                    started = Some(generation);
                    if control
                        .send(Control::SynthesisStarted { generation })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                if outbound.send(MediaEvent::Audio(tagged)).await.is_err() {
                    debug!("Transport closed, stopping synthesis forwarding");
                    break;
                }
            }
            Some(Ok(SynthesisOutput::Done { generation })) => {
                if control
                    .send(Control::SynthesisDone { generation })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Some(Err(error)) => {
                let _ = control.send(Control::SynthesisFailed(error)).await;
                break;
            }
            None => {
                if !cancel.is_cancelled() {
                    let _ = control
                        .send(Control::SynthesisFailed(StageError::transient(
                            StageKind::Synthesizer,
                            "synthesis session ended",
                        )))
                        .await;
                }
                break;
            }
        }
    }
    debug!("Synthesis forwarder stopped");
}
