//! The running monitor: one stream connection, one pipeline, operator commands
//! and decode results multiplexed in a single task.

use anyhow::Context;
use std::path::Path;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::control::Command;
#[cfg(feature = "forward")]
use crate::decoder::DecodeForwarder;
use crate::decoder::types::{DecodeBoard, DecodeOutcome, DecodeResult, PendingDecode};
use crate::pipeline::{FrameOutcome, Pipeline};
use crate::stream::StreamConnection;
use crate::view;

/// Everything the running session owns
pub struct Session {
    conn: StreamConnection,
    pipeline: Pipeline,
    view_filter: Option<String>,
    board: DecodeBoard,
    #[cfg_attr(not(feature = "forward"), allow(dead_code))]
    decode_tx: mpsc::Sender<DecodeResult>,
    #[cfg(feature = "forward")]
    forwarder: Option<DecodeForwarder>,
}

impl Session {
    pub fn new(
        conn: StreamConnection,
        pipeline: Pipeline,
        view_filter: Option<String>,
        decode_tx: mpsc::Sender<DecodeResult>,
    ) -> Self {
        Self {
            conn,
            pipeline,
            view_filter,
            board: DecodeBoard::default(),
            decode_tx,
            #[cfg(feature = "forward")]
            forwarder: None,
        }
    }

    #[cfg(feature = "forward")]
    pub fn with_forwarder(mut self, forwarder: Option<DecodeForwarder>) -> Self {
        self.forwarder = forwarder;
        self
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Open the uplink stream; failure leaves the session running unsubscribed
    pub async fn connect(&mut self) {
        if let Err(e) = self.conn.open().await {
            error!("{:#}", e);
            warn!("Not connected. Use `reconnect` or change a filter to subscribe.");
        }
    }

    /// Process frames, commands and decode results until quit or Ctrl+C
    pub async fn run(
        &mut self,
        mut commands: mpsc::Receiver<Command>,
        mut decode_results: mpsc::Receiver<DecodeResult>,
    ) {
        info!("Monitor running. Type commands on stdin, Ctrl+C to stop.");

        loop {
            tokio::select! {
                frame = self.conn.next_frame(), if self.conn.is_open() => match frame {
                    Some(text) => self.on_frame(&text),
                    None => warn!(
                        "Uplink stream closed; not reconnecting. Use `reconnect` or change a filter."
                    ),
                },
                Some(command) = commands.recv() => {
                    if !self.on_command(command).await {
                        break;
                    }
                }
                Some(result) = decode_results.recv() => self.on_decode(result),
                _ = tokio::signal::ctrl_c() => break,
            }
        }

        info!("Shutting down...");
        self.conn.close().await;
    }

    fn on_frame(&mut self, text: &str) {
        match self.pipeline.handle_frame(text) {
            FrameOutcome::Published { forward } => {
                self.show_snapshot();
                if let Some(pending) = forward {
                    self.forward(pending);
                }
            }
            FrameOutcome::Payload(payload) => {
                info!(
                    "FRMPayload from {}: {}",
                    payload.dev_eui.as_deref().unwrap_or("-"),
                    payload.frm_payload
                );
            }
            FrameOutcome::Malformed | FrameOutcome::Ignored | FrameOutcome::Filtered => {}
        }
    }

    #[cfg(feature = "forward")]
    fn forward(&self, pending: PendingDecode) {
        if let Some(forwarder) = &self.forwarder {
            debug!("Forwarding payload #{} to decode service", pending.seq);
            forwarder.spawn(pending, self.decode_tx.clone());
        }
    }

    #[cfg(not(feature = "forward"))]
    fn forward(&self, pending: PendingDecode) {
        debug!("Forwarding disabled, dropping decode request #{}", pending.seq);
    }

    fn on_decode(&mut self, result: DecodeResult) {
        let seq = result.seq;
        if !self.board.apply(result) {
            debug!("Discarding stale decode result #{}", seq);
            return;
        }
        match self.board.latest().map(|r| &r.outcome) {
            Some(DecodeOutcome::Decoded(phy_payload)) => {
                info!("PHYPayload #{}: {}", seq, phy_payload)
            }
            Some(DecodeOutcome::Failed(message)) => warn!("Decode #{} failed: {}", seq, message),
            None => {}
        }
    }

    /// Returns `false` when the session should end
    async fn on_command(&mut self, command: Command) -> bool {
        let resubscribe = command.is_filter_change();

        match command {
            Command::Device(input) => self.pipeline.filter_mut().set_device(input.as_deref()),
            Command::Router(pattern) => self.pipeline.filter_mut().set_router(pattern.as_deref()),
            Command::Match(policy) => self.pipeline.filter_mut().set_policy(policy),
            Command::View(pattern) => {
                self.view_filter = pattern;
                self.show_snapshot();
            }
            Command::RecordStart => {
                self.pipeline.recorder_mut().start();
                info!("Recording started (buffer cleared)");
            }
            Command::RecordStop => {
                self.pipeline.recorder_mut().stop();
                info!(
                    "Recording stopped ({} samples buffered)",
                    self.pipeline.recorder().samples().len()
                );
            }
            Command::Export(path) => {
                if let Err(e) = self.export(&path).await {
                    error!("Export failed: {:#}", e);
                }
            }
            Command::Reconnect => self.resubscribe().await,
            Command::Status => self.show_status(),
            Command::Quit => return false,
        }

        if resubscribe {
            info!("Filters changed: {}", self.pipeline.filter());
            self.resubscribe().await;
        }
        true
    }

    /// Tear the subscription down and open a fresh one
    async fn resubscribe(&mut self) {
        self.conn.close().await;
        if let Err(e) = self.conn.open().await {
            error!("{:#}", e);
        }
    }

    /// Write the recorded samples as CSV
    pub async fn export(&self, path: &Path) -> anyhow::Result<()> {
        let recorder = self.pipeline.recorder();
        tokio::fs::write(path, recorder.export()?)
            .await
            .with_context(|| format!("failed to write {:?}", path))?;
        info!("Exported {} samples to {:?}", recorder.samples().len(), path);
        Ok(())
    }

    fn show_snapshot(&self) {
        let Some(snapshot) = self.pipeline.published() else {
            return;
        };
        info!(
            "Uplink from {} heard by {} router(s) at {}",
            snapshot.dev_eui.as_deref().unwrap_or("-"),
            snapshot.reports.len(),
            snapshot.received_at.format("%H:%M:%S%.3f")
        );
        for row in view::rank_by_rssi(&snapshot.reports, self.view_filter.as_deref()) {
            info!(
                "  #{:<2} RID={} ({}) SNR={} RSSI={} Δ={}",
                row.rank,
                row.report.router_id,
                row.router_mac,
                fmt_opt(row.report.snr),
                fmt_opt(row.report.rssi),
                view::format_delta(row.report.delta),
            );
        }
        let snr_order: Vec<String> = view::order_by_snr(&snapshot.reports)
            .iter()
            .map(|r| format!("{}:{}", r.router_id, fmt_opt(r.snr)))
            .collect();
        debug!("  SNR order: {}", snr_order.join(" "));
    }

    fn show_status(&self) {
        let recorder = self.pipeline.recorder();
        info!("Stream: {} ({})", self.conn.url(), self.conn.state());
        info!("Filters: {}", self.pipeline.filter());
        info!(
            "View filter: {}",
            self.view_filter.as_deref().unwrap_or("*")
        );
        info!("Routers tracked: {}", self.pipeline.deltas().len());
        info!(
            "Recorder: {} ({} samples)",
            if recorder.is_active() { "recording" } else { "stopped" },
            recorder.samples().len()
        );
        if let Some(latest) = self.board.latest() {
            info!("Last decode #{}: {:?}", latest.seq, latest.outcome);
        }
    }
}

fn fmt_opt(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}
