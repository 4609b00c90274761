//! Typed rows written by ingestion. Each converts to a [`DynRow`] without an id so
//! the store assigns one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::{DynRow, DynValue};

fn base_row(now: DateTime<Utc>) -> DynRow {
    let mut row = DynRow::new();
    row.insert("created_at".into(), now.into());
    row.insert("modified_at".into(), now.into());
    row.insert("disabled".into(), false.into());
    row
}

fn put(row: &mut DynRow, column: &str, value: impl Into<DynValue>) {
    row.insert(column.to_string(), value.into());
}

#[derive(Debug, Clone)]
pub struct NewProvider {
    pub name: String,
}

impl NewProvider {
    pub fn to_row(&self, now: DateTime<Utc>) -> DynRow {
        let mut row = DynRow::new();
        put(&mut row, "name", self.name.as_str());
        row.extend(base_row(now));
        row
    }
}

#[derive(Debug, Clone)]
pub struct NewService {
    pub provider_id: i64,
    pub name: String,
}

impl NewService {
    pub fn to_row(&self, now: DateTime<Utc>) -> DynRow {
        let mut row = DynRow::new();
        put(&mut row, "provider_id", self.provider_id);
        put(&mut row, "name", self.name.as_str());
        row.extend(base_row(now));
        row
    }
}

#[derive(Debug, Clone)]
pub struct NewRegion {
    pub provider_id: i64,
    pub code: String,
}

impl NewRegion {
    pub fn to_row(&self, now: DateTime<Utc>) -> DynRow {
        let mut row = DynRow::new();
        put(&mut row, "code", self.code.as_str());
        put(&mut row, "provider_id", self.provider_id);
        row.extend(base_row(now));
        row
    }
}

/// Descriptive machine attributes carried by a SKU. Missing values stay empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SkuAttributes {
    pub name: String,
    pub arm_sku_name: String,
    pub instance_sku: String,
    pub product_family: String,
    pub vcpu: i32,
    pub cpu_architecture: String,
    pub instance_type: String,
    pub storage: String,
    pub network: String,
    pub operating_system: String,
    pub usage_type: String,
    pub memory: String,
    pub physical_processor: String,
    pub max_throughput: String,
    pub enhanced_networking: String,
    pub gpu: String,
    pub max_iops: String,
}

#[derive(Debug, Clone)]
pub struct NewSku {
    pub sku_code: String,
    pub region_id: i64,
    pub provider_id: i64,
    pub region_code: String,
    pub attributes: SkuAttributes,
}

impl NewSku {
    pub fn to_row(&self, now: DateTime<Utc>) -> DynRow {
        let a = &self.attributes;
        let mut row = DynRow::new();
        put(&mut row, "sku_code", self.sku_code.as_str());
        put(&mut row, "region_id", self.region_id);
        put(&mut row, "provider_id", self.provider_id);
        put(&mut row, "region_code", self.region_code.as_str());
        put(&mut row, "name", a.name.as_str());
        put(&mut row, "arm_sku_name", a.arm_sku_name.as_str());
        put(&mut row, "instance_sku", a.instance_sku.as_str());
        put(&mut row, "product_family", a.product_family.as_str());
        put(&mut row, "vcpu", a.vcpu);
        put(&mut row, "cpu_architecture", a.cpu_architecture.as_str());
        put(&mut row, "instance_type", a.instance_type.as_str());
        put(&mut row, "storage", a.storage.as_str());
        put(&mut row, "network", a.network.as_str());
        put(&mut row, "operating_system", a.operating_system.as_str());
        put(&mut row, "usage_type", a.usage_type.as_str());
        put(&mut row, "memory", a.memory.as_str());
        put(&mut row, "physical_processor", a.physical_processor.as_str());
        put(&mut row, "max_throughput", a.max_throughput.as_str());
        put(&mut row, "enhanced_networking", a.enhanced_networking.as_str());
        put(&mut row, "gpu", a.gpu.as_str());
        put(&mut row, "max_iops", a.max_iops.as_str());
        row.extend(base_row(now));
        row
    }
}

#[derive(Debug, Clone)]
pub struct NewPrice {
    pub sku_id: i64,
    pub effective_date: String,
    pub unit: String,
    pub price_per_unit: String,
}

impl NewPrice {
    pub fn to_row(&self, now: DateTime<Utc>) -> DynRow {
        let mut row = DynRow::new();
        put(&mut row, "sku_id", self.sku_id);
        put(&mut row, "effective_date", self.effective_date.as_str());
        put(&mut row, "unit", self.unit.as_str());
        put(&mut row, "price_per_unit", self.price_per_unit.as_str());
        row.extend(base_row(now));
        row
    }
}

/// Contract attributes of a reserved or committed price.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TermAttributes {
    pub lease_length: Option<String>,
    pub purchase_option: Option<String>,
    pub offering_class: Option<String>,
}

impl TermAttributes {
    /// On-demand prices carry no term; such rows are never written.
    pub fn is_empty(&self) -> bool {
        [&self.lease_length, &self.purchase_option, &self.offering_class]
            .iter()
            .all(|v| v.as_deref().map_or(true, |s| s.trim().is_empty()))
    }
}

#[derive(Debug, Clone)]
pub struct NewTerm {
    pub sku_id: i64,
    pub price_id: i64,
    pub attributes: TermAttributes,
}

impl NewTerm {
    pub fn to_row(&self, now: DateTime<Utc>) -> DynRow {
        let a = &self.attributes;
        let mut row = DynRow::new();
        put(&mut row, "sku_id", self.sku_id);
        put(&mut row, "price_id", self.price_id);
        put(&mut row, "lease_length", a.lease_length.clone());
        put(&mut row, "purchase_option", a.purchase_option.clone());
        put(&mut row, "offering_class", a.offering_class.clone());
        row.extend(base_row(now));
        row
    }
}

#[derive(Debug, Clone)]
pub struct NewSavingsPlan {
    pub region_id: i64,
    pub sku: String,
    pub discounted_sku: String,
    pub lease_length: i32,
    pub discounted_rate: String,
    pub discounted_instance_type: String,
    pub unit: String,
}

impl NewSavingsPlan {
    pub fn to_row(&self, now: DateTime<Utc>) -> DynRow {
        let mut row = DynRow::new();
        put(&mut row, "region_id", self.region_id);
        put(&mut row, "sku", self.sku.as_str());
        put(&mut row, "discounted_sku", self.discounted_sku.as_str());
        put(&mut row, "lease_length", self.lease_length);
        put(&mut row, "discounted_rate", self.discounted_rate.as_str());
        put(
            &mut row,
            "discounted_instance_type",
            self.discounted_instance_type.as_str(),
        );
        put(&mut row, "unit", self.unit.as_str());
        row.extend(base_row(now));
        row
    }
}
