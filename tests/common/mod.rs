#[allow(dead_code)]
pub mod builders;
#[allow(dead_code)]
pub mod harness;

#[allow(unused_imports)]
pub use builders::{fact_with, seed_novel, seed_novel_with_prescan};
#[allow(unused_imports)]
pub use harness::{test_ctx, test_ctx_with_llm, ScriptedLlm, TestCtx};
