use bytes::Bytes;

use crate::errors::ExecResult;
use crate::executor::Format;

/// Request/response shape conversion between wire formats.
pub trait Translator: Send + Sync {
    fn translate_request(
        &self,
        from: Format,
        to: Format,
        model: &str,
        payload: Bytes,
        stream: bool,
    ) -> ExecResult<Bytes>;

    fn translate_response(
        &self,
        from: Format,
        to: Format,
        model: &str,
        payload: Bytes,
    ) -> ExecResult<Bytes>;

    fn translate_stream_chunk(
        &self,
        from: Format,
        to: Format,
        model: &str,
        chunk: Bytes,
    ) -> ExecResult<Vec<Bytes>>;
}

/// Passes payloads through untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityTranslator;

impl Translator for IdentityTranslator {
    fn translate_request(
        &self,
        _from: Format,
        _to: Format,
        _model: &str,
        payload: Bytes,
        _stream: bool,
    ) -> ExecResult<Bytes> {
        Ok(payload)
    }

    fn translate_response(
        &self,
        _from: Format,
        _to: Format,
        _model: &str,
        payload: Bytes,
    ) -> ExecResult<Bytes> {
        Ok(payload)
    }

    fn translate_stream_chunk(
        &self,
        _from: Format,
        _to: Format,
        _model: &str,
        chunk: Bytes,
    ) -> ExecResult<Vec<Bytes>> {
        Ok(vec![chunk])
    }
}

pub trait TokenCounter: Send + Sync {
    fn count(&self, model: &str, text: &str) -> ExecResult<u64>;
}
