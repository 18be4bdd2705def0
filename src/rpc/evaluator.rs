// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Evaluator
//!
//! Maps method names to the procedures serving them. A target is either a ready
//! service or a factory building it; either way it is resolved on the first call
//! of its method and reused afterwards.

use crate::errors::{ConfigError, EvaluatorError};
use async_trait::async_trait;
use serde_json::Value;
use std::{
    collections::HashMap,
    error::Error,
    fmt,
    sync::{Arc, OnceLock},
};
use tracing::debug;

/// Method invoked on a factory built service when none was named.
pub const DEFAULT_METHOD: &str = "invoke";

pub type ProcedureError = Box<dyn Error + Send + Sync>;

/// A service exposing remote procedures.
///
/// Returning an `EvaluatorError` keeps its code; any other error is reported as
/// an application error.
#[async_trait]
pub trait Procedure: Send + Sync {
    async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, ProcedureError>;
}

pub type ServiceFactory = Box<dyn Fn() -> Arc<dyn Procedure> + Send + Sync>;

pub enum Target {
    Service {
        service: Arc<dyn Procedure>,
        method: String,
    },
    Factory {
        factory: ServiceFactory,
        method: Option<String>,
    },
}

impl Target {
    pub fn service(service: Arc<dyn Procedure>, method: &str) -> Target {
        Target::Service {
            service,
            method: method.to_owned(),
        }
    }

    pub fn factory<F>(factory: F, method: Option<&str>) -> Target
    where
        F: Fn() -> Arc<dyn Procedure> + Send + Sync + 'static,
    {
        Target::Factory {
            factory: Box::new(factory),
            method: method.map(str::to_owned),
        }
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Service { method, .. } => f.debug_struct("Service").field("method", method).finish(),
            Target::Factory { method, .. } => f.debug_struct("Factory").field("method", method).finish(),
        }
    }
}

struct Bound {
    service: Arc<dyn Procedure>,
    method: String,
}

struct Registration {
    target: Target,
    bound: OnceLock<Bound>,
}

impl Registration {
    fn bound(&self) -> &Bound {
        self.bound.get_or_init(|| match &self.target {
            Target::Service { service, method } => Bound {
                service: service.clone(),
                method: method.clone(),
            },
            Target::Factory { factory, method } => Bound {
                service: factory(),
                method: method.clone().unwrap_or_else(|| DEFAULT_METHOD.to_owned()),
            },
        })
    }
}

#[derive(Default)]
pub struct Evaluator {
    methods: HashMap<String, Registration>,
}

impl Evaluator {
    pub fn new() -> Evaluator {
        Evaluator::default()
    }

    pub fn add_method(&mut self, name: &str, target: Target) -> Result<(), ConfigError> {
        if self.methods.contains_key(name) {
            return Err(ConfigError::DuplicateMethod(name.to_owned()));
        }

        debug!(method = name, ?target, "registering remote procedure");
        self.methods.insert(
            name.to_owned(),
            Registration {
                target,
                bound: OnceLock::new(),
            },
        );

        Ok(())
    }

    /// Calls `name` with positional `args`.
    pub async fn evaluate(&self, name: &str, args: Vec<Value>) -> Result<Value, EvaluatorError> {
        let registration = self
            .methods
            .get(name)
            .ok_or_else(|| EvaluatorError::MethodNotFound(name.to_owned()))?;

        let bound = registration.bound();
        bound
            .service
            .call(&bound.method, args)
            .await
            .map_err(|err| match err.downcast::<EvaluatorError>() {
                Ok(err) => *err,
                Err(err) => EvaluatorError::Application {
                    code: 0,
                    message: err.to_string(),
                    data: None,
                },
            })
    }
}
