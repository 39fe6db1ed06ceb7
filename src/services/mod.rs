pub(crate) mod document_storage;
pub(crate) mod eligibility;
pub(crate) mod evaluation;
pub(crate) mod generation;
pub(crate) mod normalizer;
pub(crate) mod ports;
pub(crate) mod retry;
pub(crate) mod scratch;
pub(crate) mod storage;
pub(crate) mod submission_saga;
pub(crate) mod text_generation;
