use std::sync::Arc;

use keyrelay_provider_core::{Executor, TokenCounter};

use crate::codex::CodexExecutor;
use crate::gemini::GeminiExecutor;

/// Every executor shipped with keyrelay, keyed by `identifier()` at registration.
pub fn builtin_executors(counter: Arc<dyn TokenCounter>) -> Vec<Arc<dyn Executor>> {
    vec![
        Arc::new(CodexExecutor::new(counter)),
        Arc::new(GeminiExecutor),
    ]
}
