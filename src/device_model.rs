//! Device domain model interface (spec §1 "Out of scope": the concrete
//! device domain model — endpoints/features/attributes/commands — beyond
//! its interface to the protocol handler).
//!
//! This module specifies and implements only that interface, plus a small
//! in-memory model realistic enough to drive the protocol handler's tests.
//! A production device would supply its own [`DeviceModel`] backed by real
//! hardware state.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde_cbor::Value as CborValue;

use crate::model::ZoneType;

/// Context carried into every command invocation: who's calling, not a
/// global (spec §9 "Ambient context for authorization").
#[derive(Debug, Clone)]
pub struct InvokeContext {
    pub zone_id: String,
    pub zone_type: ZoneType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrWriteError {
    NotFound,
    ReadOnly,
    Constraint(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    NotFound,
    Other(String),
}

/// Observes device-model-originated attribute changes and fans them out to
/// every subscribed zone session plus the service event bus (spec §9
/// "Callback-centric fan-out": "Represent this as an explicit subscriber
/// interface with a single method `on_attribute_changed`"). A successful
/// `Write` feeds this same path, so a hardware-driven change and a
/// controller-driven write reach subscribers identically.
pub trait FeatureSubscriber: Send + Sync {
    fn on_attribute_changed(&self, endpoint_id: u32, feature_id: u32, attribute_id: u32, value: CborValue);
}

/// The interface the protocol handler dispatches into (spec §4.8). Endpoint
/// and feature existence checks happen one level up in the handler, which
/// is why they aren't part of this trait's error surface — by the time
/// these methods are called, (endpoint_id, feature_id) is already known
/// valid.
pub trait DeviceModel: Send + Sync {
    fn has_endpoint(&self, endpoint_id: u32) -> bool;
    fn has_feature(&self, endpoint_id: u32, feature_id: u32) -> bool;

    /// All attribute ids readable on (endpoint_id, feature_id), used when a
    /// Read request's `attribute_ids` is empty.
    fn readable_attributes(&self, endpoint_id: u32, feature_id: u32) -> Vec<u32>;

    /// Returns `None` for an attribute that doesn't exist or isn't
    /// readable — the handler silently omits it rather than erroring.
    fn read_attribute(&self, endpoint_id: u32, feature_id: u32, attribute_id: u32) -> Option<CborValue>;

    /// Applies a write and reads the value back, surfacing any constraint
    /// clamping (spec §4.8 "Successful writes read the value back").
    fn write_attribute(
        &self,
        endpoint_id: u32,
        feature_id: u32,
        attribute_id: u32,
        value: CborValue,
    ) -> Result<CborValue, AttrWriteError>;

    fn invoke(
        &self,
        ctx: &InvokeContext,
        endpoint_id: u32,
        feature_id: u32,
        command_id: u32,
        params: CborValue,
    ) -> Result<Option<CborValue>, CommandError>;
}

struct FeatureState {
    attributes: BTreeMap<u32, CborValue>,
    read_only: bool,
    /// Attribute ids that reject writes with a constraint error, to
    /// exercise the StatusConstraintError path in tests.
    constrained: Vec<u32>,
}

/// A minimal in-memory model: a fixed set of (endpoint, feature) pairs each
/// holding a flat attribute map. Good enough to drive realistic protocol
/// handler tests without standing up real hardware bindings.
pub struct InMemoryDeviceModel {
    features: RwLock<BTreeMap<(u32, u32), FeatureState>>,
}

impl Default for InMemoryDeviceModel {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDeviceModel {
    pub fn new() -> Self {
        Self { features: RwLock::new(BTreeMap::new()) }
    }

    pub fn add_feature(&self, endpoint_id: u32, feature_id: u32, read_only: bool) {
        self.features.write().insert(
            (endpoint_id, feature_id),
            FeatureState { attributes: BTreeMap::new(), read_only, constrained: Vec::new() },
        );
    }

    pub fn set_attribute(&self, endpoint_id: u32, feature_id: u32, attribute_id: u32, value: CborValue) {
        if let Some(feature) = self.features.write().get_mut(&(endpoint_id, feature_id)) {
            feature.attributes.insert(attribute_id, value);
        }
    }

    /// Marks an attribute as constrained: writes to it always clamp to a
    /// fixed ceiling of 100, exercising the read-back-surfaces-clamping path.
    pub fn constrain_attribute(&self, endpoint_id: u32, feature_id: u32, attribute_id: u32) {
        if let Some(feature) = self.features.write().get_mut(&(endpoint_id, feature_id)) {
            feature.constrained.push(attribute_id);
        }
    }
}

const CONSTRAINT_CEILING: i128 = 100;

impl DeviceModel for InMemoryDeviceModel {
    fn has_endpoint(&self, endpoint_id: u32) -> bool {
        self.features.read().keys().any(|(e, _)| *e == endpoint_id)
    }

    fn has_feature(&self, endpoint_id: u32, feature_id: u32) -> bool {
        self.features.read().contains_key(&(endpoint_id, feature_id))
    }

    fn readable_attributes(&self, endpoint_id: u32, feature_id: u32) -> Vec<u32> {
        self.features
            .read()
            .get(&(endpoint_id, feature_id))
            .map(|f| f.attributes.keys().copied().collect())
            .unwrap_or_default()
    }

    fn read_attribute(&self, endpoint_id: u32, feature_id: u32, attribute_id: u32) -> Option<CborValue> {
        self.features.read().get(&(endpoint_id, feature_id))?.attributes.get(&attribute_id).cloned()
    }

    fn write_attribute(
        &self,
        endpoint_id: u32,
        feature_id: u32,
        attribute_id: u32,
        value: CborValue,
    ) -> Result<CborValue, AttrWriteError> {
        let mut features = self.features.write();
        let feature = features.get_mut(&(endpoint_id, feature_id)).ok_or(AttrWriteError::NotFound)?;
        if feature.read_only {
            return Err(AttrWriteError::ReadOnly);
        }
        if !feature.attributes.contains_key(&attribute_id) {
            return Err(AttrWriteError::NotFound);
        }

        let stored = if feature.constrained.contains(&attribute_id) {
            clamp(&value)
        } else {
            value
        };
        feature.attributes.insert(attribute_id, stored.clone());
        Ok(stored)
    }

    fn invoke(
        &self,
        _ctx: &InvokeContext,
        endpoint_id: u32,
        feature_id: u32,
        _command_id: u32,
        _params: CborValue,
    ) -> Result<Option<CborValue>, CommandError> {
        if !self.has_feature(endpoint_id, feature_id) {
            return Err(CommandError::NotFound);
        }
        Err(CommandError::NotFound)
    }
}

fn clamp(value: &CborValue) -> CborValue {
    match value {
        CborValue::Integer(i) if *i > CONSTRAINT_CEILING => CborValue::Integer(CONSTRAINT_CEILING),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_back_reflects_constraint_clamp() {
        let model = InMemoryDeviceModel::new();
        model.add_feature(1, 1, false);
        model.constrain_attribute(1, 1, 9);

        let clamped = model.write_attribute(1, 1, 9, CborValue::Integer(500)).unwrap();
        assert_eq!(clamped, CborValue::Integer(100));
        assert_eq!(model.read_attribute(1, 1, 9), Some(CborValue::Integer(100)));
    }

    #[test]
    fn write_to_read_only_feature_fails() {
        let model = InMemoryDeviceModel::new();
        model.add_feature(1, 1, true);
        model.set_attribute(1, 1, 1, CborValue::Integer(1));
        assert_eq!(
            model.write_attribute(1, 1, 1, CborValue::Integer(2)),
            Err(AttrWriteError::ReadOnly)
        );
    }

    #[test]
    fn unknown_attribute_write_is_not_found() {
        let model = InMemoryDeviceModel::new();
        model.add_feature(1, 1, false);
        assert_eq!(
            model.write_attribute(1, 1, 999, CborValue::Integer(2)),
            Err(AttrWriteError::NotFound)
        );
    }
}
