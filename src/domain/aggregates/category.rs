//! Product categories and their delivery policy

use serde::{Deserialize, Serialize};
use crate::domain::value_objects::DeliveryMethod;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub name: String,
    pub delivery_method: DeliveryMethod,
    /// Fields the customer fills in at checkout, e.g. a player id.
    #[serde(default)]
    pub custom_fields: Vec<CustomField>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomField { pub name: String, #[serde(default)] pub required: bool }

impl Category {
    pub fn new(name: impl Into<String>, delivery_method: DeliveryMethod) -> Self {
        Self { name: name.into(), delivery_method, custom_fields: vec![] }
    }

    pub fn with_field(mut self, name: impl Into<String>, required: bool) -> Self {
        self.custom_fields.push(CustomField { name: name.into(), required });
        self
    }

    /// First required field that is missing or blank in `values`.
    pub fn missing_field<'a>(&'a self, values: &std::collections::BTreeMap<String, String>) -> Option<&'a str> {
        self.custom_fields
            .iter()
            .filter(|f| f.required)
            .find(|f| values.get(&f.name).map_or(true, |v| v.trim().is_empty()))
            .map(|f| f.name.as_str())
    }
}
