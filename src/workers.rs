//! Dispatching named operations to a worker farm.
//!
//! The farm itself, and how it runs work (threads, processes), is not part of
//! this crate. [`LocalFarm`] runs registered functions in-process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::error::WorkerError;
use crate::plugin::{Config, Diagnostic, Validator, ValidatorScope};
use crate::types::AssetGroup;

/// Name of the per-asset validation function.
pub const RUN_VALIDATE: &str = "run_validate";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationRequest {
    pub group: AssetGroup,
    /// Validators configured for the group's file.
    pub validators: Vec<String>,
    pub config: Config,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkerMessage {
    Validate(ValidationRequest),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerReply {
    pub diagnostics: Vec<Diagnostic>,
}

pub type WorkerFn = dyn Fn(&WorkerMessage) -> anyhow::Result<WorkerReply> + Send + Sync;

/// A callable bound to one farm function.
#[derive(Clone)]
pub struct WorkerHandle {
    name: String,
    function: Option<Arc<WorkerFn>>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&self, message: &WorkerMessage) -> Result<WorkerReply, WorkerError> {
        let function = self
            .function
            .as_ref()
            .ok_or_else(|| WorkerError::UnknownFunction(self.name.clone()))?;

        function(message).map_err(|e| WorkerError::Failed(self.name.clone(), e))
    }
}

/// Lets workers call back into the orchestrating process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReverseHandle(usize);

impl ReverseHandle {
    pub fn id(&self) -> usize {
        self.0
    }
}

pub trait WorkerFarm: Send + Sync {
    fn create_handle(&self, function: &str) -> WorkerHandle;

    fn create_reverse_handle(&self, callback: Box<dyn Fn() + Send + Sync>) -> ReverseHandle;
}

#[derive(Default)]
pub struct LocalFarm {
    functions: HashMap<String, Arc<WorkerFn>>,
    reverse: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
    next_reverse: AtomicUsize,
}

impl LocalFarm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(mut self, name: &str, function: F) -> Self
    where
        F: Fn(&WorkerMessage) -> anyhow::Result<WorkerReply> + Send + Sync + 'static,
    {
        self.functions.insert(name.to_string(), Arc::new(function));
        self
    }

    /// A farm serving [`RUN_VALIDATE`] with the given asset validators.
    pub fn with_validators(validators: Vec<Arc<dyn Validator>>) -> Self {
        Self::new().register(RUN_VALIDATE, validation_worker(validators))
    }

    /// Invokes every registered reverse handle callback.
    pub fn notify_reverse(&self) {
        let callbacks = self.reverse.lock().unwrap_or_else(PoisonError::into_inner);
        for callback in callbacks.iter() {
            callback();
        }
    }
}

impl WorkerFarm for LocalFarm {
    fn create_handle(&self, function: &str) -> WorkerHandle {
        WorkerHandle {
            name: function.to_string(),
            function: self.functions.get(function).cloned(),
        }
    }

    fn create_reverse_handle(&self, callback: Box<dyn Fn() + Send + Sync>) -> ReverseHandle {
        self.reverse
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);

        ReverseHandle(self.next_reverse.fetch_add(1, Ordering::Relaxed))
    }
}

/// The worker side of [`RUN_VALIDATE`]: runs the asset-scoped validators
/// named in the request against its single asset group.
pub fn validation_worker(
    validators: Vec<Arc<dyn Validator>>,
) -> impl Fn(&WorkerMessage) -> anyhow::Result<WorkerReply> + Send + Sync + 'static {
    move |message| {
        let WorkerMessage::Validate(request) = message;
        let mut reply = WorkerReply::default();

        for validator in &validators {
            if validator.scope() != ValidatorScope::Asset
                || !request.validators.iter().any(|name| name == validator.name())
            {
                continue;
            }

            let groups = std::slice::from_ref(&request.group);
            reply
                .diagnostics
                .extend(validator.validate(groups, &request.config)?);
        }

        Ok(reply)
    }
}
