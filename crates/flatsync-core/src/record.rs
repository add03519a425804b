//! Canonical, consumer-facing listing schema.
//!
//! Every field is always present; absent source data shows up as the field's
//! default, never as a missing key.

use serde::{Deserialize, Serialize};

use crate::ListingKind;

pub const DEFAULT_TITLE: &str = "Без названия";
pub const DEFAULT_DESCRIPTION: &str = "Нет описания";
pub const DEFAULT_STREET: &str = "Не указана";
pub const DEFAULT_HOUSE_NUMBER: &str = "0";
pub const DEFAULT_PLACE_NAME: &str = "Не указан";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CanonicalRecord {
    Sale(SaleRecord),
    Rent(RentRecord),
}

impl CanonicalRecord {
    pub fn default_for(kind: ListingKind) -> Self {
        match kind {
            ListingKind::Sale => CanonicalRecord::Sale(SaleRecord::default()),
            ListingKind::Rent => CanonicalRecord::Rent(RentRecord::default()),
        }
    }

    pub fn kind(&self) -> ListingKind {
        match self {
            CanonicalRecord::Sale(_) => ListingKind::Sale,
            CanonicalRecord::Rent(_) => ListingKind::Rent,
        }
    }

    pub fn as_sale(&self) -> Option<&SaleRecord> {
        match self {
            CanonicalRecord::Sale(record) => Some(record),
            CanonicalRecord::Rent(_) => None,
        }
    }

    pub fn as_rent(&self) -> Option<&RentRecord> {
        match self {
            CanonicalRecord::Rent(record) => Some(record),
            CanonicalRecord::Sale(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Region {
    pub name: String,
}

impl Default for Region {
    fn default() -> Self {
        Self {
            name: DEFAULT_PLACE_NAME.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Town {
    pub region: Region,
    pub name: String,
}

impl Default for Town {
    fn default() -> Self {
        Self {
            region: Region::default(),
            name: DEFAULT_PLACE_NAME.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Location {
    pub town: Town,
    pub district: String,
    pub microdistrict: String,
    pub street: String,
    pub house_number: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl Default for Location {
    fn default() -> Self {
        Self {
            town: Town::default(),
            district: String::new(),
            microdistrict: String::new(),
            street: DEFAULT_STREET.to_string(),
            house_number: DEFAULT_HOUSE_NUMBER.to_string(),
            latitude: None,
            longitude: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WallMaterial {
    Panel,
    Brick,
    Monolithic,
    Block,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Building {
    pub location: Location,
    pub floors_total: Option<i64>,
    pub wall_material: Option<WallMaterial>,
    pub construction_year: Option<i64>,
    pub house_amenities: String,
    pub parking: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BalconyType {
    Loggia,
    Classic,
    French,
    Extended,
    No,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaleConditions {
    Open,
    Alternative,
    Condition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PropertyCondition {
    #[default]
    New,
    Almost,
    Good,
    Fair,
    Renovation,
    Uninhabitable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OwnershipType {
    Private,
    State,
    Joint,
    Shared,
    Collective,
    Foreign,
}

/// Canonical for-sale flat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SaleRecord {
    pub building: Building,
    pub images: Vec<String>,
    pub title: String,
    pub price: f64,
    pub total_area: f64,
    pub living_area: Option<f64>,
    pub kitchen_area: Option<f64>,
    pub balcony_area: Option<f64>,
    pub balcony: Option<BalconyType>,
    pub room_count: i64,
    pub description: String,
    pub floor: i64,
    pub sale_conditions: Option<SaleConditions>,
    pub bathroom_count: Option<i64>,
    pub ceiling_height: Option<f64>,
    pub renovation: String,
    pub condition: PropertyCondition,
    pub contract_number: String,
    pub contract_date: Option<String>,
    pub level_count: Option<i64>,
    pub ownership_type: Option<OwnershipType>,
    pub link: String,
}

impl Default for SaleRecord {
    fn default() -> Self {
        Self {
            building: Building::default(),
            images: Vec::new(),
            title: DEFAULT_TITLE.to_string(),
            price: 0.0,
            total_area: 0.0,
            living_area: None,
            kitchen_area: None,
            balcony_area: None,
            balcony: None,
            room_count: 1,
            description: DEFAULT_DESCRIPTION.to_string(),
            floor: 1,
            sale_conditions: None,
            bathroom_count: None,
            ceiling_height: None,
            renovation: String::new(),
            condition: PropertyCondition::New,
            contract_number: String::new(),
            contract_date: None,
            level_count: None,
            ownership_type: None,
            link: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bathroom {
    Combined,
    Separate,
    Multiple,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RentTerm {
    Daily,
    Short,
    Long,
    Monthly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RentCondition {
    KidsOk,
    PetsOk,
    NoPets,
    UtilitiesIncluded,
    UtilitiesSeparate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Prepayment {
    #[serde(rename = "1_month")]
    OneMonth,
    #[serde(rename = "2_months")]
    TwoMonths,
    #[serde(rename = "100_percent")]
    Full,
    #[serde(rename = "no_prepayment")]
    None,
}

/// Canonical long-term rental flat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RentRecord {
    pub building: Building,
    pub images: Vec<String>,
    pub title: String,
    pub price: f64,
    pub total_area: f64,
    pub living_area: Option<f64>,
    pub kitchen_area: Option<f64>,
    pub balcony: bool,
    pub floor: i64,
    pub description: String,
    pub room_count: i64,
    pub separate_rooms: Option<i64>,
    pub renovation: String,
    pub furniture: bool,
    pub bathroom: Option<Bathroom>,
    pub quarter: Option<f64>,
    pub term_of_rent: Option<RentTerm>,
    pub contract_number: String,
    pub rent_conditions: Option<RentCondition>,
    pub prepayment: Option<Prepayment>,
    pub parking: bool,
    pub layout: Option<String>,
    pub link: String,
}

impl Default for RentRecord {
    fn default() -> Self {
        Self {
            building: Building::default(),
            images: Vec::new(),
            title: DEFAULT_TITLE.to_string(),
            price: 0.0,
            total_area: 0.0,
            living_area: None,
            kitchen_area: None,
            balcony: false,
            floor: 1,
            description: DEFAULT_DESCRIPTION.to_string(),
            room_count: 1,
            separate_rooms: None,
            renovation: String::new(),
            furniture: true,
            bathroom: None,
            quarter: None,
            term_of_rent: None,
            contract_number: String::new(),
            rent_conditions: None,
            prepayment: None,
            parking: false,
            layout: None,
            link: String::new(),
        }
    }
}
