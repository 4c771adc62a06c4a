//! A typed view over the primary container of an unstructured deployment.
//!
//! Only `args`, `resources` and `env` are reachable through the view, and each
//! of them is read, modified and written back on its own. Everything else on
//! the container and the pod template is left exactly as rendered.

use k8s_openapi::api::core::v1::{EnvVar, ResourceRequirements};
use kube::api::DynamicObject;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::crd::NameValue;
use crate::error::PatchError;

const CONTAINERS_PATH: &str = "spec.template.spec.containers";

/// Mutable access to container 0 of a deployment.
#[derive(Debug)]
pub struct ContainerView<'a> {
    container: &'a mut Map<String, Value>,
}

impl<'a> ContainerView<'a> {
    /// Resolve the single container of `deployment`.
    pub fn of(deployment: &'a mut DynamicObject) -> Result<Self, PatchError> {
        let containers = deployment
            .data
            .get_mut("spec")
            .and_then(|v| v.get_mut("template"))
            .and_then(|v| v.get_mut("spec"))
            .and_then(|v| v.get_mut("containers"))
            .and_then(Value::as_array_mut)
            .ok_or(PatchError::MissingField(CONTAINERS_PATH))?;
        if containers.len() != 1 {
            return Err(PatchError::ContainerCount(containers.len()));
        }
        let container = containers[0]
            .as_object_mut()
            .ok_or(PatchError::MissingField(CONTAINERS_PATH))?;
        Ok(ContainerView { container })
    }

    fn read<T: DeserializeOwned + Default>(&self, field: &'static str) -> Result<T, PatchError> {
        match self.container.get(field) {
            None | Some(Value::Null) => Ok(T::default()),
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|source| PatchError::Decode { field, source }),
        }
    }

    /// Write `value` to `field`, returning whether the stored tree changed.
    fn write<T: Serialize>(&mut self, field: &'static str, value: &T) -> Result<bool, PatchError> {
        let value =
            serde_json::to_value(value).map_err(|source| PatchError::Encode { field, source })?;
        if self.container.get(field) == Some(&value) {
            return Ok(false);
        }
        self.container.insert(field.to_string(), value);
        Ok(true)
    }

    /// The container args, empty when unset.
    pub fn args(&self) -> Result<Vec<String>, PatchError> {
        self.read("args")
    }

    /// Replace the container args.
    pub fn set_args(&mut self, args: &[String]) -> Result<bool, PatchError> {
        self.write("args", &args)
    }

    /// Set `--<flag>=<value>`, replacing any argument for the same flag.
    ///
    /// Flags are matched by prefix, so the position of an existing flag is
    /// kept and applying the same value twice changes nothing.
    pub fn set_flag(&mut self, flag: &str, value: &str) -> Result<bool, PatchError> {
        let prefix = format!("--{}=", flag);
        let wanted = format!("{}{}", prefix, value);
        let mut found = false;
        let mut args: Vec<String> = self
            .args()?
            .into_iter()
            .filter_map(|arg| {
                if !arg.starts_with(&prefix) {
                    return Some(arg);
                }
                if found {
                    return None;
                }
                found = true;
                Some(wanted.clone())
            })
            .collect();
        if !found {
            args.push(wanted);
        }
        self.set_args(&args)
    }

    /// The container resource requirements, empty when unset.
    pub fn resources(&self) -> Result<ResourceRequirements, PatchError> {
        self.read("resources")
    }

    /// Replace the whole resources sub-tree.
    pub fn set_resources(&mut self, resources: &ResourceRequirements) -> Result<bool, PatchError> {
        self.write("resources", resources)
    }

    /// The container environment, empty when unset.
    pub fn env(&self) -> Result<Vec<EnvVar>, PatchError> {
        self.read("env")
    }

    /// Merge `declared` into the container's environment by name.
    ///
    /// A declared name that already exists replaces that entry in place; new
    /// names are appended in declaration order. When a name is declared more
    /// than once the last value wins. Entries with other names are kept.
    pub fn merge_env(&mut self, declared: &[NameValue]) -> Result<bool, PatchError> {
        let mut env = self.env()?;
        for nv in dedup_last_wins(declared) {
            let entry = EnvVar {
                name: nv.name.clone(),
                value: Some(nv.value.clone()),
                value_from: None,
            };
            match env.iter_mut().find(|e| e.name == nv.name) {
                Some(existing) => *existing = entry,
                None => env.push(entry),
            }
        }
        self.write("env", &env)
    }
}

/// Collapse duplicate names, keeping the first position and the last value.
fn dedup_last_wins(declared: &[NameValue]) -> Vec<&NameValue> {
    let mut out: Vec<&NameValue> = Vec::with_capacity(declared.len());
    for nv in declared {
        match out.iter_mut().find(|seen| seen.name == nv.name) {
            Some(seen) => *seen = nv,
            None => out.push(nv),
        }
    }
    out
}
