use tiktoken_rs::{CoreBPE, cl100k_base, get_bpe_from_model, o200k_base};

use keyrelay_provider_core::{ExecResult, ExecutorError, TokenCounter};

/// Local token counting with the tiktoken vocabularies.
#[derive(Debug, Default, Clone, Copy)]
pub struct TiktokenCounter;

impl TokenCounter for TiktokenCounter {
    fn count(&self, model: &str, text: &str) -> ExecResult<u64> {
        if text.is_empty() {
            return Ok(0);
        }
        let bpe = bpe_for_model(model).map_err(ExecutorError::Other)?;
        Ok(bpe.encode_ordinary(text).len() as u64)
    }
}

fn bpe_for_model(model: &str) -> Result<CoreBPE, String> {
    let model = model.trim();
    if !model.is_empty() {
        if let Ok(bpe) = get_bpe_from_model(model) {
            return Ok(bpe);
        }
        if is_o200k_model(model) {
            return o200k_base().map_err(|err| err.to_string());
        }
    }
    cl100k_base().map_err(|err| err.to_string())
}

fn is_o200k_model(model: &str) -> bool {
    model.starts_with("gpt-5")
        || model.starts_with("gpt-4.1")
        || model.starts_with("gpt-4o")
        || model.starts_with("o1")
        || model.starts_with("o3")
        || model.starts_with("o4")
        || model.starts_with("codex")
}
