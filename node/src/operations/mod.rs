pub(crate) mod backoff;
pub(crate) mod reconciler;
pub(crate) mod runner;

pub(crate) use backoff::Backoff;
pub(crate) use reconciler::Reconciler;
pub(crate) use runner::OperationRunner;
