use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tracing::debug;

use keyrelay_provider_core::{ExecCtx, ExecResult, ExecStream, Format, UpstreamBody};

const STREAM_BUFFER: usize = 32;

/// Splits an upstream SSE body into lines and forwards each one through the
/// translator, newline-terminated.
///
/// The pump stops as soon as the receiver is dropped, which drops the
/// upstream body and with it the outbound connection.
pub(crate) fn forward_lines(
    ctx: &ExecCtx,
    from: Format,
    to: Format,
    model: String,
    body: UpstreamBody,
) -> ExecStream {
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    let translator = ctx.translator.clone();
    let trace_id = ctx.trace_id.clone();
    tokio::spawn(async move {
        let emit = |line: &[u8]| -> Vec<ExecResult<Bytes>> {
            match translator.translate_stream_chunk(from, to, &model, Bytes::copy_from_slice(line)) {
                Ok(chunks) => chunks
                    .into_iter()
                    .map(|chunk| {
                        let mut out = BytesMut::with_capacity(chunk.len() + 1);
                        out.extend_from_slice(&chunk);
                        out.extend_from_slice(b"\n");
                        Ok(out.freeze())
                    })
                    .collect(),
                Err(err) => vec![Err(err)],
            }
        };

        let mut upstream = match body {
            UpstreamBody::Stream(rx) => rx,
            UpstreamBody::Bytes(bytes) => {
                let (single_tx, single_rx) = mpsc::channel(1);
                let _ = single_tx.send(bytes).await;
                single_rx
            }
        };
        let mut buffer = BytesMut::new();
        while let Some(chunk) = upstream.recv().await {
            buffer.extend_from_slice(&chunk);
            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line = buffer.split_to(pos + 1);
                for item in emit(trim_line_end(&line)) {
                    if tx.send(item).await.is_err() {
                        debug!(event = "stream_cancelled", trace_id = %trace_id);
                        return;
                    }
                }
            }
        }
        if !buffer.is_empty() {
            for item in emit(trim_line_end(&buffer)) {
                if tx.send(item).await.is_err() {
                    return;
                }
            }
        }
    });
    rx
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && matches!(line[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    &line[..end]
}

/// Payload of an SSE `data:` line, if the line is one.
pub(crate) fn data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim)
}
