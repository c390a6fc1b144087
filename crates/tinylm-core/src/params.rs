//! Parameter registration.
//!
//! Every learnable tensor is created through a [`ParamScope`], which puts it in
//! the matching optimizer group of the variable store and records its full
//! name in [`ParamGroups`]. The optimizer builder later checks the recorded
//! partition against the variable store.

use std::collections::BTreeSet;

use tch::{nn, Tensor};

use crate::error::{Error, Result};

/// Optimizer group of matrix-multiply weights.
pub const DECAY_GROUP: usize = 0;
/// Optimizer group of biases, norm parameters and embedding tables.
pub const NO_DECAY_GROUP: usize = 1;

/// Standard deviation of the normal initialisation of weights.
pub const INIT_STD: f64 = 0.02;

#[derive(Debug, Clone, Default)]
pub struct ParamGroups {
    decayed: BTreeSet<String>,
    undecayed: BTreeSet<String>,
}

impl ParamGroups {
    pub fn decayed(&self) -> &BTreeSet<String> {
        &self.decayed
    }

    pub fn undecayed(&self) -> &BTreeSet<String> {
        &self.undecayed
    }

    /// Checks that the groups cover every variable of `vs` exactly once.
    pub fn check_partition(&self, vs: &nn::VarStore) -> Result<()> {
        let overlap: Vec<_> = self.decayed.intersection(&self.undecayed).cloned().collect();
        if !overlap.is_empty() {
            return Err(Error::Config(format!(
                "parameters {overlap:?} are in both the decay and no-decay groups"
            )));
        }

        let all: BTreeSet<String> = vs.variables().into_keys().collect();
        let grouped: BTreeSet<String> = self.decayed.union(&self.undecayed).cloned().collect();

        let missing: Vec<_> = all.difference(&grouped).cloned().collect();
        if !missing.is_empty() {
            return Err(Error::Config(format!(
                "parameters {missing:?} were not assigned to an optimizer group"
            )));
        }
        let unknown: Vec<_> = grouped.difference(&all).cloned().collect();
        if !unknown.is_empty() {
            return Err(Error::Config(format!(
                "grouped parameters {unknown:?} do not exist in the model"
            )));
        }
        Ok(())
    }
}

/// A `nn::Path` that also knows its dotted name.
pub struct ParamScope<'a> {
    path: nn::Path<'a>,
    prefix: Option<String>,
}

impl<'a> ParamScope<'a> {
    pub fn new(path: nn::Path<'a>) -> Self {
        Self { path, prefix: None }
    }

    pub fn sub<T: ToString>(&self, name: T) -> Self {
        let name = name.to_string();
        Self {
            path: self.path.sub(&name),
            prefix: Some(self.qualify(&name)),
        }
    }

    fn qualify(&self, name: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}.{name}"),
            None => name.to_string(),
        }
    }

    pub fn decayed(
        &self,
        groups: &mut ParamGroups,
        name: &str,
        dims: &[i64],
        init: nn::Init,
    ) -> Tensor {
        groups.decayed.insert(self.qualify(name));
        self.path.set_group(DECAY_GROUP).var(name, dims, init)
    }

    pub fn undecayed(
        &self,
        groups: &mut ParamGroups,
        name: &str,
        dims: &[i64],
        init: nn::Init,
    ) -> Tensor {
        groups.undecayed.insert(self.qualify(name));
        self.path.set_group(NO_DECAY_GROUP).var(name, dims, init)
    }
}

/// Linear layer with a decayed weight and an undecayed bias.
pub fn linear(
    scope: &ParamScope,
    groups: &mut ParamGroups,
    in_dim: i64,
    out_dim: i64,
    bias: bool,
    stdev: f64,
) -> nn::Linear {
    let ws = scope.decayed(
        groups,
        "weight",
        &[out_dim, in_dim],
        nn::Init::Randn { mean: 0.0, stdev },
    );
    let bs = bias.then(|| scope.undecayed(groups, "bias", &[out_dim], nn::Init::Const(0.0)));
    nn::Linear { ws, bs }
}

/// Lookup table; undecayed.
#[derive(Debug)]
pub struct Embedding {
    weight: Tensor,
}

impl Embedding {
    pub fn new(scope: &ParamScope, groups: &mut ParamGroups, num: i64, dim: i64) -> Self {
        let weight = scope.undecayed(
            groups,
            "weight",
            &[num, dim],
            nn::Init::Randn { mean: 0.0, stdev: INIT_STD },
        );
        Self { weight }
    }

    pub fn forward(&self, idx: &Tensor) -> Tensor {
        Tensor::embedding(&self.weight, idx, -1, false, false)
    }
}
