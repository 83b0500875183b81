use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::macros::{format_description, offset};
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};
use uuid::Uuid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RegisterError {
    #[error("unknown SKU: {0}")]
    UnknownSku(String),
    #[error("invalid bundle definition: {0}")]
    InvalidBundle(String),
    #[error("cart is empty")]
    EmptyCart,
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),
    #[error("ledger store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("ledger append failed: {0}")]
    StoreAppend(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// All register timestamps are pinned to the stall's local timezone.
pub const JST: UtcOffset = offset!(+9);

#[must_use]
pub fn now_jst() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(JST)
}

/// Formats a timestamp in the ledger's wire format (`YYYY-MM-DD hh:mm:ss`, JST).
///
/// # Errors
/// Returns [`RegisterError::Configuration`] when formatting fails.
pub fn format_sheet_timestamp(value: OffsetDateTime) -> Result<String, RegisterError> {
    let format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    value
        .to_offset(JST)
        .format(format)
        .map_err(|err| RegisterError::Configuration(format!("failed to format timestamp: {err}")))
}

/// Parses a ledger timestamp, accepting the sheet format and RFC3339.
///
/// # Errors
/// Returns [`RegisterError::Configuration`] when the value matches neither format.
pub fn parse_sheet_timestamp(value: &str) -> Result<OffsetDateTime, RegisterError> {
    let trimmed = value.trim();
    let format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    if let Ok(parsed) = PrimitiveDateTime::parse(trimmed, format) {
        return Ok(parsed.assume_offset(JST));
    }

    OffsetDateTime::parse(trimmed, &time::format_description::well_known::Rfc3339)
        .map(|parsed| parsed.to_offset(JST))
        .map_err(|err| RegisterError::Configuration(format!("invalid timestamp {trimmed}: {err}")))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SkuKind {
    Base,
    Bundle,
    DiscountBundle,
}

impl SkuKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Base => "base",
            Self::Bundle => "bundle",
            Self::DiscountBundle => "discount_bundle",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "base" => Some(Self::Base),
            "bundle" => Some(Self::Bundle),
            "discount_bundle" => Some(Self::DiscountBundle),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_bundle(self) -> bool {
        matches!(self, Self::Bundle | Self::DiscountBundle)
    }
}

/// One priced entry of the stall's menu.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SkuRecord {
    pub name: String,
    pub unit_price: i64,
    #[serde(default)]
    pub unit_cost: Option<i64>,
    pub kind: SkuKind,
    /// Base item names this SKU resolves to; empty for base items.
    #[serde(default)]
    pub components: Vec<String>,
}

impl SkuRecord {
    fn base(name: &str, unit_price: i64, unit_cost: i64) -> Self {
        Self {
            name: name.to_string(),
            unit_price,
            unit_cost: Some(unit_cost),
            kind: SkuKind::Base,
            components: Vec::new(),
        }
    }

    fn bundle(name: &str, unit_price: i64, kind: SkuKind, components: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            unit_price,
            unit_cost: None,
            kind,
            components: components.iter().map(ToString::to_string).collect(),
        }
    }
}

/// The closed set of sellable SKUs, validated at load time.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Catalog {
    skus: Vec<SkuRecord>,
}

impl Catalog {
    /// Builds a catalog from SKU records.
    ///
    /// # Errors
    /// Returns [`RegisterError::Configuration`] when names are duplicated or
    /// empty, prices or costs are negative, or bundle components do not
    /// resolve to base items.
    pub fn new(skus: Vec<SkuRecord>) -> Result<Self, RegisterError> {
        let catalog = Self { skus };
        catalog.validate()?;
        Ok(catalog)
    }

    /// The festival menu this register shipped with.
    #[must_use]
    pub fn standard() -> Self {
        Self {
            skus: vec![
                SkuRecord::base("焼きそば", 500, 180),
                SkuRecord::base("焼きとうもろこし", 400, 150),
                SkuRecord::base("フランクフルト", 300, 120),
                SkuRecord::base("ラムネ", 250, 80),
                SkuRecord::base("缶ジュース", 150, 60),
                SkuRecord::bundle(
                    "焼きそば&ラムネセット",
                    700,
                    SkuKind::Bundle,
                    &["焼きそば", "ラムネ"],
                ),
                SkuRecord::bundle(
                    "焼きそば&缶ジュースセット",
                    600,
                    SkuKind::Bundle,
                    &["焼きそば", "缶ジュース"],
                ),
                SkuRecord::bundle(
                    "【経シス割引券】焼きそば&ラムネセット",
                    600,
                    SkuKind::DiscountBundle,
                    &["焼きそば", "ラムネ"],
                ),
                SkuRecord::bundle(
                    "【特別割引券】焼きそば&ラムネセット",
                    500,
                    SkuKind::DiscountBundle,
                    &["焼きそば", "ラムネ"],
                ),
                SkuRecord::bundle(
                    "【PiedPiper割引券】焼きそば&缶ジュースセット",
                    500,
                    SkuKind::DiscountBundle,
                    &["焼きそば", "缶ジュース"],
                ),
            ],
        }
    }

    /// Decodes and validates a catalog from JSON.
    ///
    /// # Errors
    /// Returns [`RegisterError::Configuration`] when decoding fails or the
    /// decoded records violate catalog constraints.
    pub fn from_json(value: &Value) -> Result<Self, RegisterError> {
        let catalog: Self = serde_json::from_value(value.clone())
            .map_err(|err| RegisterError::Configuration(format!("invalid catalog JSON: {err}")))?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Validates the record set as a whole.
    ///
    /// # Errors
    /// Returns [`RegisterError::Configuration`] on any malformed record.
    pub fn validate(&self) -> Result<(), RegisterError> {
        let mut seen = BTreeSet::new();
        for sku in &self.skus {
            if sku.name.trim().is_empty() {
                return Err(RegisterError::Configuration(
                    "SKU name must not be empty".to_string(),
                ));
            }
            if !seen.insert(sku.name.as_str()) {
                return Err(RegisterError::Configuration(format!(
                    "duplicate SKU name: {}",
                    sku.name
                )));
            }
            if sku.unit_price < 0 {
                return Err(RegisterError::Configuration(format!(
                    "negative unit_price for {}",
                    sku.name
                )));
            }
            if matches!(sku.unit_cost, Some(cost) if cost < 0) {
                return Err(RegisterError::Configuration(format!(
                    "negative unit_cost for {}",
                    sku.name
                )));
            }
            match sku.kind {
                SkuKind::Base => {
                    if !sku.components.is_empty() {
                        return Err(RegisterError::Configuration(format!(
                            "base SKU {} must not declare components",
                            sku.name
                        )));
                    }
                }
                SkuKind::Bundle | SkuKind::DiscountBundle => {
                    if sku.components.is_empty() {
                        return Err(RegisterError::Configuration(format!(
                            "bundle SKU {} must declare components",
                            sku.name
                        )));
                    }
                    for component in &sku.components {
                        let resolves_to_base = self
                            .skus
                            .iter()
                            .any(|other| other.name == *component && other.kind == SkuKind::Base);
                        if !resolves_to_base {
                            return Err(RegisterError::Configuration(format!(
                                "bundle SKU {} component {component} is not a base SKU",
                                sku.name
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn skus(&self) -> &[SkuRecord] {
        &self.skus
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&SkuRecord> {
        self.skus.iter().find(|sku| sku.name == name)
    }

    /// Unit price of a statically defined SKU.
    ///
    /// # Errors
    /// Returns [`RegisterError::UnknownSku`] when the name is not in the catalog.
    pub fn price(&self, name: &str) -> Result<i64, RegisterError> {
        self.get(name)
            .map(|sku| sku.unit_price)
            .ok_or_else(|| RegisterError::UnknownSku(name.to_string()))
    }

    pub fn base_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.skus
            .iter()
            .filter(|sku| sku.kind == SkuKind::Base)
            .map(|sku| sku.name.as_str())
    }
}

/// A custom bundle priced on the spot for one order.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CustomBundle {
    pub name: String,
    pub price: i64,
    /// Sorted base item names.
    pub components: Vec<String>,
}

/// Display name for a custom bundle; identical definitions collapse to one SKU.
#[must_use]
pub fn custom_bundle_name(sorted_components: &[String], price: i64) -> String {
    format!("カスタムセット({}/{price}円)", sorted_components.join("+"))
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CartLine {
    pub name: String,
    pub unit_price: i64,
    pub quantity: i64,
}

/// One till's in-progress order: the item sequence plus the custom bundle
/// definitions created for it. Both are released together by [`Session::clear`].
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Session {
    items: Vec<String>,
    custom_bundles: Vec<CustomBundle>,
}

impl Session {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn items(&self) -> &[String] {
        &self.items
    }

    #[must_use]
    pub fn custom_bundles(&self) -> &[CustomBundle] {
        &self.custom_bundles
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn custom_bundle(&self, name: &str) -> Option<&CustomBundle> {
        self.custom_bundles.iter().find(|bundle| bundle.name == name)
    }

    /// Registers a session-scoped bundle and returns its generated name.
    ///
    /// # Errors
    /// Returns [`RegisterError::InvalidBundle`] when the component set is
    /// empty, the price is not positive, or a component is not a base SKU.
    pub fn define_custom_bundle(
        &mut self,
        catalog: &Catalog,
        components: &[String],
        price: i64,
    ) -> Result<String, RegisterError> {
        if components.is_empty() {
            return Err(RegisterError::InvalidBundle(
                "component set must not be empty".to_string(),
            ));
        }
        if price <= 0 {
            return Err(RegisterError::InvalidBundle(format!(
                "price must be positive, got {price}"
            )));
        }

        let mut sorted: Vec<String> = components.to_vec();
        sorted.sort();
        sorted.dedup();
        for component in &sorted {
            match catalog.get(component) {
                Some(sku) if sku.kind == SkuKind::Base => {}
                Some(sku) => {
                    return Err(RegisterError::InvalidBundle(format!(
                        "component {component} is a {}, not a base item",
                        sku.kind.as_str()
                    )));
                }
                None => {
                    return Err(RegisterError::InvalidBundle(format!(
                        "component {component} is not in the catalog"
                    )));
                }
            }
        }

        let name = custom_bundle_name(&sorted, price);
        if self.custom_bundle(&name).is_none() {
            self.custom_bundles.push(CustomBundle {
                name: name.clone(),
                price,
                components: sorted,
            });
        }
        Ok(name)
    }

    /// Appends one unit of a SKU to the order.
    ///
    /// # Errors
    /// Returns [`RegisterError::UnknownSku`] when the name resolves to neither
    /// a catalog entry nor a live custom bundle; the cart is left unchanged.
    pub fn add(&mut self, catalog: &Catalog, name: &str) -> Result<(), RegisterError> {
        self.resolve_price(catalog, name)?;
        self.items.push(name.to_string());
        Ok(())
    }

    /// Current order total, recomputed from scratch on every call.
    ///
    /// # Errors
    /// Returns [`RegisterError::UnknownSku`] when an item no longer resolves.
    pub fn total(&self, catalog: &Catalog) -> Result<i64, RegisterError> {
        let mut total = 0;
        for name in &self.items {
            total += self.resolve_price(catalog, name)?;
        }
        Ok(total)
    }

    /// Order lines grouped per SKU, in first-occurrence order.
    ///
    /// # Errors
    /// Returns [`RegisterError::UnknownSku`] when an item no longer resolves.
    pub fn grouped(&self, catalog: &Catalog) -> Result<Vec<CartLine>, RegisterError> {
        let mut order: Vec<&str> = Vec::new();
        let mut counts: BTreeMap<&str, i64> = BTreeMap::new();
        for name in &self.items {
            if !counts.contains_key(name.as_str()) {
                order.push(name.as_str());
            }
            *counts.entry(name.as_str()).or_insert(0) += 1;
        }

        order
            .into_iter()
            .map(|name| {
                Ok(CartLine {
                    name: name.to_string(),
                    unit_price: self.resolve_price(catalog, name)?,
                    quantity: counts.get(name).copied().unwrap_or(0),
                })
            })
            .collect()
    }

    /// Empties the order and releases its custom bundle definitions.
    pub fn clear(&mut self) {
        self.items.clear();
        self.custom_bundles.clear();
    }

    fn resolve_price(&self, catalog: &Catalog, name: &str) -> Result<i64, RegisterError> {
        if let Some(sku) = catalog.get(name) {
            return Ok(sku.unit_price);
        }
        if let Some(bundle) = self.custom_bundle(name) {
            return Ok(bundle.price);
        }
        Err(RegisterError::UnknownSku(name.to_string()))
    }

    /// Base item multiset a SKU resolves to: a base item yields itself, a
    /// bundle its declared components.
    ///
    /// # Errors
    /// Returns [`RegisterError::UnknownSku`] when the name does not resolve.
    pub fn decompose(&self, catalog: &Catalog, name: &str) -> Result<Vec<String>, RegisterError> {
        if let Some(sku) = catalog.get(name) {
            return Ok(if sku.kind == SkuKind::Base {
                vec![sku.name.clone()]
            } else {
                sku.components.clone()
            });
        }
        if let Some(bundle) = self.custom_bundle(name) {
            return Ok(bundle.components.clone());
        }
        Err(RegisterError::UnknownSku(name.to_string()))
    }
}

pub const COL_TIMESTAMP: &str = "タイムスタンプ";
pub const COL_TRANSACTION_ID: &str = "TransactionID";
pub const COL_TOTAL: &str = "合計金額";
/// Counter column shared by all custom bundles; they have no column of their own.
pub const COL_ADHOC_BUNDLE: &str = "カスタムセット";

const FIXED_COLUMNS: usize = 3;

/// The ledger's ordered column list. Columns are stable identifiers once
/// introduced; later versions only append, never rename or remove.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LedgerSchema {
    version: u32,
    columns: Vec<String>,
}

impl LedgerSchema {
    /// The original sheet layout.
    #[must_use]
    pub fn v1() -> Self {
        Self {
            version: 1,
            columns: [
                COL_TIMESTAMP,
                COL_TRANSACTION_ID,
                COL_TOTAL,
                "焼きそば",
                "焼きとうもろこし",
                "フランクフルト",
                "ラムネ",
                "缶ジュース",
                "焼きそば&ラムネセット",
                "焼きそば&缶ジュースセット",
            ]
            .iter()
            .map(ToString::to_string)
            .collect(),
        }
    }

    /// v1 plus the discount coupon columns.
    #[must_use]
    pub fn v2() -> Self {
        let mut schema = Self::v1();
        schema.version = 2;
        for column in [
            "【経シス割引券】焼きそば&ラムネセット",
            "【特別割引券】焼きそば&ラムネセット",
            "【PiedPiper割引券】焼きそば&缶ジュースセット",
        ] {
            schema.columns.push(column.to_string());
        }
        schema
    }

    /// v2 plus the custom bundle counter.
    #[must_use]
    pub fn v3() -> Self {
        let mut schema = Self::v2();
        schema.version = 3;
        schema.columns.push(COL_ADHOC_BUNDLE.to_string());
        schema
    }

    #[must_use]
    pub fn current() -> Self {
        Self::v3()
    }

    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }

    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// The SKU columns after the three fixed ones.
    #[must_use]
    pub fn sku_columns(&self) -> &[String] {
        &self.columns[FIXED_COLUMNS..]
    }

    #[must_use]
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|column| column == name)
    }

    /// Checks the fixed prefix and column uniqueness.
    ///
    /// # Errors
    /// Returns [`RegisterError::Configuration`] on violation.
    pub fn validate(&self) -> Result<(), RegisterError> {
        let expected = [COL_TIMESTAMP, COL_TRANSACTION_ID, COL_TOTAL];
        if self.columns.len() < FIXED_COLUMNS
            || self.columns[..FIXED_COLUMNS] != expected.map(ToString::to_string)
        {
            return Err(RegisterError::Configuration(format!(
                "ledger schema must start with {expected:?}"
            )));
        }
        let mut seen = BTreeSet::new();
        for column in &self.columns {
            if !seen.insert(column.as_str()) {
                return Err(RegisterError::Configuration(format!(
                    "duplicate ledger column: {column}"
                )));
            }
        }
        Ok(())
    }
}

/// One completed transaction; immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerRow {
    pub timestamp: OffsetDateTime,
    pub transaction_id: Uuid,
    pub total_amount: i64,
    /// Count per SKU column, zero-filled over the schema the row was read with.
    pub quantities: BTreeMap<String, i64>,
}

/// Encodes the order into a ledger row with the given stamp and id.
///
/// Every bundle occurrence increments its own identity column (the custom
/// bundle counter for session bundles) and each of its base component columns,
/// so per-base-item totals stay accurate across bundle generations.
///
/// # Errors
/// Returns [`RegisterError::EmptyCart`] for an empty order,
/// [`RegisterError::UnknownSku`] for an unresolvable item, and
/// [`RegisterError::SchemaMismatch`] when an item has no ledger column or the
/// priced total disagrees with the order total; nothing may be appended then.
pub fn encode_checkout(
    session: &Session,
    catalog: &Catalog,
    schema: &LedgerSchema,
    timestamp: OffsetDateTime,
    transaction_id: Uuid,
) -> Result<LedgerRow, RegisterError> {
    if session.is_empty() {
        return Err(RegisterError::EmptyCart);
    }

    let mut quantities: BTreeMap<String, i64> = schema
        .sku_columns()
        .iter()
        .map(|column| (column.clone(), 0))
        .collect();
    let mut priced_total = 0;

    fn bump(quantities: &mut BTreeMap<String, i64>, column: &str) -> Result<(), RegisterError> {
        match quantities.get_mut(column) {
            Some(count) => {
                *count += 1;
                Ok(())
            }
            None => Err(RegisterError::SchemaMismatch(format!(
                "no ledger column for {column}"
            ))),
        }
    }

    for name in session.items() {
        if let Some(sku) = catalog.get(name) {
            bump(&mut quantities, name)?;
            priced_total += sku.unit_price;
            if sku.kind.is_bundle() {
                for component in &sku.components {
                    bump(&mut quantities, component)?;
                }
            }
        } else if let Some(bundle) = session.custom_bundle(name) {
            bump(&mut quantities, COL_ADHOC_BUNDLE)?;
            priced_total += bundle.price;
            for component in &bundle.components {
                bump(&mut quantities, component)?;
            }
        } else {
            return Err(RegisterError::UnknownSku(name.clone()));
        }
    }

    let total_amount = session.total(catalog)?;
    if total_amount != priced_total {
        return Err(RegisterError::SchemaMismatch(format!(
            "priced column total {priced_total} disagrees with order total {total_amount}"
        )));
    }

    Ok(LedgerRow {
        timestamp,
        transaction_id,
        total_amount,
        quantities,
    })
}

/// [`encode_checkout`] with a fresh JST timestamp and transaction id.
///
/// # Errors
/// See [`encode_checkout`].
pub fn encode(
    session: &Session,
    catalog: &Catalog,
    schema: &LedgerSchema,
) -> Result<LedgerRow, RegisterError> {
    encode_checkout(session, catalog, schema, now_jst(), Uuid::new_v4())
}

/// Serializes a row into cells following the schema's declared column order.
///
/// # Errors
/// Returns [`RegisterError::Configuration`] when timestamp formatting fails.
pub fn to_cells(row: &LedgerRow, schema: &LedgerSchema) -> Result<Vec<String>, RegisterError> {
    let mut cells = vec![
        format_sheet_timestamp(row.timestamp)?,
        row.transaction_id.to_string(),
        row.total_amount.to_string(),
    ];
    for column in schema.sku_columns() {
        cells.push(
            row.quantities
                .get(column)
                .copied()
                .unwrap_or(0)
                .to_string(),
        );
    }
    Ok(cells)
}

/// A bulk read of the ledger: a header row naming columns, then data rows.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct RawTable {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// Decodes stored rows against the current schema, tolerating drift.
///
/// Columns are matched by name: stored columns absent from the schema are
/// ignored and schema columns absent from the data read as zero. All-empty
/// rows are padding and skipped; a row whose timestamp does not parse is
/// dropped; unparseable numerics degrade to zero. Input order is preserved.
#[must_use]
pub fn decode_table(table: &RawTable, schema: &LedgerSchema) -> Vec<LedgerRow> {
    let index_of: BTreeMap<&str, usize> = table
        .header
        .iter()
        .enumerate()
        .map(|(index, name)| (name.as_str(), index))
        .collect();

    let cell = |row: &[String], column: &str| -> String {
        index_of
            .get(column)
            .and_then(|&index| row.get(index))
            .map_or_else(String::new, |value| value.trim().to_string())
    };

    let mut decoded = Vec::new();
    for row in &table.rows {
        if row.iter().all(|value| value.trim().is_empty()) {
            continue;
        }
        let Ok(timestamp) = parse_sheet_timestamp(&cell(row, COL_TIMESTAMP)) else {
            continue;
        };
        let transaction_id =
            Uuid::parse_str(&cell(row, COL_TRANSACTION_ID)).unwrap_or_else(|_| Uuid::nil());
        let total_amount = parse_numeric_cell(&cell(row, COL_TOTAL));
        let quantities = schema
            .sku_columns()
            .iter()
            .map(|column| (column.clone(), parse_numeric_cell(&cell(row, column))))
            .collect();

        decoded.push(LedgerRow {
            timestamp,
            transaction_id,
            total_amount,
            quantities,
        });
    }
    decoded
}

#[allow(clippy::cast_possible_truncation)]
fn parse_numeric_cell(value: &str) -> i64 {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return 0;
    }
    if let Ok(parsed) = trimmed.parse::<i64>() {
        return parsed;
    }
    trimmed.parse::<f64>().map_or(0, |parsed| parsed as i64)
}

/// The consumed ledger store: whole-row atomic append plus bulk read.
/// Append ordering across concurrent sessions is the store's responsibility.
pub trait LedgerStore {
    /// Appends one encoded row whose cells follow the schema's column order.
    ///
    /// # Errors
    /// Returns [`RegisterError::StoreAppend`] or
    /// [`RegisterError::StoreUnavailable`]; the row must not be partially written.
    fn append(&mut self, cells: &[String]) -> Result<(), RegisterError>;

    /// Reads the full ledger including its header row.
    ///
    /// # Errors
    /// Returns [`RegisterError::StoreUnavailable`] when the read fails.
    fn read_all(&self) -> Result<RawTable, RegisterError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckoutReceipt {
    pub timestamp: OffsetDateTime,
    pub transaction_id: Uuid,
    pub total_amount: i64,
    pub lines: Vec<CartLine>,
}

/// Encodes the order, appends it, and clears the session on success.
/// On any failure the session is left intact so the same checkout can be
/// retried without re-entering items.
///
/// # Errors
/// Propagates encode errors ([`encode_checkout`]) and store errors unmodified.
pub fn checkout(
    session: &mut Session,
    catalog: &Catalog,
    schema: &LedgerSchema,
    store: &mut dyn LedgerStore,
) -> Result<CheckoutReceipt, RegisterError> {
    let lines = session.grouped(catalog)?;
    let row = encode(session, catalog, schema)?;
    let cells = to_cells(&row, schema)?;
    store.append(&cells)?;
    session.clear();
    Ok(CheckoutReceipt {
        timestamp: row.timestamp,
        transaction_id: row.transaction_id,
        total_amount: row.total_amount,
        lines,
    })
}

/// Analytics tuning: trend bucket width, mining thresholds, and the explicit
/// coupon-to-canonical-bundle table (never inferred from names).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalyticsConfig {
    pub config_version: u32,
    pub bucket_width_minutes: i64,
    pub min_support: f64,
    pub min_lift: f64,
    pub min_transactions: usize,
    pub coupon_map: BTreeMap<String, String>,
}

impl AnalyticsConfig {
    #[must_use]
    pub fn v1() -> Self {
        let mut coupon_map = BTreeMap::new();
        coupon_map.insert(
            "【経シス割引券】焼きそば&ラムネセット".to_string(),
            "焼きそば&ラムネセット".to_string(),
        );
        coupon_map.insert(
            "【特別割引券】焼きそば&ラムネセット".to_string(),
            "焼きそば&ラムネセット".to_string(),
        );
        coupon_map.insert(
            "【PiedPiper割引券】焼きそば&缶ジュースセット".to_string(),
            "焼きそば&缶ジュースセット".to_string(),
        );
        Self {
            config_version: 1,
            bucket_width_minutes: 30,
            min_support: 0.05,
            min_lift: 1.0,
            min_transactions: 11,
            coupon_map,
        }
    }

    /// Decodes and validates a config from JSON.
    ///
    /// # Errors
    /// Returns [`RegisterError::Configuration`] when decoding fails or values
    /// are out of bounds.
    pub fn from_json(value: &Value) -> Result<Self, RegisterError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            RegisterError::Configuration(format!("invalid analytics config JSON: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validates numeric bounds.
    ///
    /// # Errors
    /// Returns [`RegisterError::Configuration`] on violation.
    pub fn validate(&self) -> Result<(), RegisterError> {
        if self.config_version == 0 {
            return Err(RegisterError::Configuration(
                "config_version must be >= 1".to_string(),
            ));
        }
        if self.bucket_width_minutes <= 0 || 60 % self.bucket_width_minutes != 0 {
            return Err(RegisterError::Configuration(format!(
                "bucket_width_minutes must divide one hour, got {}",
                self.bucket_width_minutes
            )));
        }
        if !(0.0..=1.0).contains(&self.min_support) {
            return Err(RegisterError::Configuration(format!(
                "min_support must be in [0.0, 1.0], got {}",
                self.min_support
            )));
        }
        if self.min_lift < 0.0 {
            return Err(RegisterError::Configuration(format!(
                "min_lift must not be negative, got {}",
                self.min_lift
            )));
        }
        if self.min_transactions == 0 {
            return Err(RegisterError::Configuration(
                "min_transactions must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SalesSummary {
    pub total_sales: i64,
    pub total_cost: i64,
    pub gross_profit: i64,
    pub transaction_count: usize,
    pub avg_ticket: f64,
}

/// Overall totals and margin over the decoded ledger.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn summary(rows: &[LedgerRow], catalog: &Catalog) -> SalesSummary {
    let total_sales: i64 = rows.iter().map(|row| row.total_amount).sum();
    let mut total_cost = 0;
    for sku in catalog.skus() {
        let Some(unit_cost) = sku.unit_cost else {
            continue;
        };
        if sku.kind != SkuKind::Base {
            continue;
        }
        let quantity: i64 = rows
            .iter()
            .map(|row| row.quantities.get(&sku.name).copied().unwrap_or(0))
            .sum();
        total_cost += quantity * unit_cost;
    }

    let transaction_count = rows.len();
    let avg_ticket = if transaction_count == 0 {
        0.0
    } else {
        total_sales as f64 / transaction_count as f64
    };

    SalesSummary {
        total_sales,
        total_cost,
        gross_profit: total_sales - total_cost,
        transaction_count,
        avg_ticket,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ItemSales {
    pub name: String,
    pub quantity: i64,
    pub revenue: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ItemRanking {
    pub by_revenue: Vec<ItemSales>,
    pub by_quantity: Vec<ItemSales>,
}

/// The columns analytics ranks and mines over: base items plus canonical
/// bundles, with coupon variants folded into their canonical bundle. The
/// custom bundle counter is excluded; it has no single price.
struct AnalysisView {
    /// (name, canonical unit price) in catalog declaration order.
    items: Vec<(String, i64)>,
    /// Ledger column name -> analysis item name.
    fold: BTreeMap<String, String>,
}

fn analysis_view(catalog: &Catalog, config: &AnalyticsConfig) -> Result<AnalysisView, RegisterError> {
    let mut items = Vec::new();
    let mut fold = BTreeMap::new();

    for sku in catalog.skus() {
        match sku.kind {
            SkuKind::Base | SkuKind::Bundle => {
                items.push((sku.name.clone(), sku.unit_price));
                fold.insert(sku.name.clone(), sku.name.clone());
            }
            SkuKind::DiscountBundle => {
                let canonical = config.coupon_map.get(&sku.name).ok_or_else(|| {
                    RegisterError::Configuration(format!(
                        "discount bundle {} has no canonical mapping",
                        sku.name
                    ))
                })?;
                let is_canonical_bundle = catalog
                    .get(canonical)
                    .is_some_and(|target| target.kind == SkuKind::Bundle);
                if !is_canonical_bundle {
                    return Err(RegisterError::Configuration(format!(
                        "canonical mapping target {canonical} is not a bundle SKU"
                    )));
                }
                fold.insert(sku.name.clone(), canonical.clone());
            }
        }
    }

    Ok(AnalysisView { items, fold })
}

impl AnalysisView {
    /// Folded quantity per analysis item for one row.
    fn folded_quantities(&self, row: &LedgerRow) -> BTreeMap<&str, i64> {
        let mut folded: BTreeMap<&str, i64> = BTreeMap::new();
        for (column, quantity) in &row.quantities {
            let Some(target) = self.fold.get(column) else {
                continue;
            };
            *folded.entry(target.as_str()).or_insert(0) += quantity;
        }
        folded
    }
}

/// Per-item sales rankings by revenue and by quantity. Ties preserve catalog
/// declaration order.
///
/// # Errors
/// Returns [`RegisterError::Configuration`] when a discount bundle has no
/// canonical mapping or the mapping target is not a bundle.
pub fn item_ranking(
    rows: &[LedgerRow],
    catalog: &Catalog,
    config: &AnalyticsConfig,
) -> Result<ItemRanking, RegisterError> {
    let view = analysis_view(catalog, config)?;
    let mut totals: BTreeMap<&str, i64> = BTreeMap::new();
    for row in rows {
        for (name, quantity) in view.folded_quantities(row) {
            *totals.entry(name).or_insert(0) += quantity;
        }
    }

    let sales: Vec<ItemSales> = view
        .items
        .iter()
        .map(|(name, unit_price)| {
            let quantity = totals.get(name.as_str()).copied().unwrap_or(0);
            ItemSales {
                name: name.clone(),
                quantity,
                revenue: quantity * unit_price,
            }
        })
        .collect();

    let mut by_revenue = sales.clone();
    by_revenue.sort_by_key(|item| std::cmp::Reverse(item.revenue));
    let mut by_quantity = sales;
    by_quantity.sort_by_key(|item| std::cmp::Reverse(item.quantity));

    Ok(ItemRanking {
        by_revenue,
        by_quantity,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrendBucket {
    pub start: OffsetDateTime,
    pub count: usize,
    pub revenue: i64,
}

/// Partitions rows into fixed-width buckets anchored to the first observed
/// timestamp's natural boundary. The series is dense: buckets without
/// transactions appear with zero values.
///
/// # Errors
/// Returns [`RegisterError::Configuration`] when the width does not divide an
/// hour or a timestamp falls outside the representable range.
pub fn time_trend(
    rows: &[LedgerRow],
    bucket_width_minutes: i64,
) -> Result<Vec<TrendBucket>, RegisterError> {
    if bucket_width_minutes <= 0 || 60 % bucket_width_minutes != 0 {
        return Err(RegisterError::Configuration(format!(
            "bucket_width_minutes must divide one hour, got {bucket_width_minutes}"
        )));
    }
    if rows.is_empty() {
        return Ok(Vec::new());
    }

    let width_seconds = bucket_width_minutes * 60;
    let stamps: Vec<i64> = rows.iter().map(|row| row.timestamp.unix_timestamp()).collect();
    let first = stamps.iter().copied().min().unwrap_or(0);
    let last = stamps.iter().copied().max().unwrap_or(0);
    let anchor = first - first.rem_euclid(width_seconds);
    let last_anchor = last - last.rem_euclid(width_seconds);

    let bucket_count = usize::try_from((last_anchor - anchor) / width_seconds + 1)
        .map_err(|_| RegisterError::Configuration("trend span too large".to_string()))?;

    let mut buckets = Vec::with_capacity(bucket_count);
    for index in 0..bucket_count {
        let start_unix = anchor + i64::try_from(index).unwrap_or(i64::MAX) * width_seconds;
        let start = OffsetDateTime::from_unix_timestamp(start_unix)
            .map_err(|err| RegisterError::Configuration(format!("timestamp out of range: {err}")))?
            .to_offset(JST);
        buckets.push(TrendBucket {
            start,
            count: 0,
            revenue: 0,
        });
    }

    for (row, stamp) in rows.iter().zip(&stamps) {
        let index = usize::try_from((stamp - anchor) / width_seconds)
            .map_err(|_| RegisterError::Configuration("trend span too large".to_string()))?;
        if let Some(bucket) = buckets.get_mut(index) {
            bucket.count += 1;
            bucket.revenue += row.total_amount;
        }
    }

    Ok(buckets)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssociationRule {
    pub antecedent: Vec<String>,
    pub consequent: Vec<String>,
    pub support: f64,
    pub confidence: f64,
    pub lift: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum BasketMiningOutcome {
    Rules(Vec<AssociationRule>),
    /// Mining was skipped: the ledger holds `have` transactions but `required`
    /// are needed before rules are trustworthy.
    InsufficientData { have: usize, required: usize },
}

/// Mines association rules over item pairs.
///
/// Supports are computed over the boolean basket matrix of analysis-relevant
/// items; itemsets up to size two are kept at `min_support`, and rules are
/// reported when `lift > min_lift`. Output ordering is deterministic: lift
/// descending, then confidence, then names.
///
/// # Errors
/// Returns [`RegisterError::Configuration`] for an invalid coupon mapping.
#[allow(clippy::cast_precision_loss)]
pub fn mine_rules(
    rows: &[LedgerRow],
    catalog: &Catalog,
    config: &AnalyticsConfig,
) -> Result<BasketMiningOutcome, RegisterError> {
    let view = analysis_view(catalog, config)?;
    if rows.len() < config.min_transactions {
        return Ok(BasketMiningOutcome::InsufficientData {
            have: rows.len(),
            required: config.min_transactions,
        });
    }

    let name_index: BTreeMap<&str, usize> = view
        .items
        .iter()
        .enumerate()
        .map(|(index, (name, _))| (name.as_str(), index))
        .collect();

    let baskets: Vec<BTreeSet<usize>> = rows
        .iter()
        .map(|row| {
            view.folded_quantities(row)
                .into_iter()
                .filter(|(_, quantity)| *quantity > 0)
                .filter_map(|(name, _)| name_index.get(name).copied())
                .collect()
        })
        .collect();

    let transaction_count = baskets.len() as f64;
    let mut single_counts = vec![0_usize; view.items.len()];
    for basket in &baskets {
        for &item in basket {
            single_counts[item] += 1;
        }
    }

    let frequent: Vec<usize> = (0..view.items.len())
        .filter(|&item| {
            single_counts[item] > 0
                && single_counts[item] as f64 / transaction_count >= config.min_support
        })
        .collect();

    let mut pair_counts: BTreeMap<(usize, usize), usize> = BTreeMap::new();
    for basket in &baskets {
        let present: Vec<usize> = frequent
            .iter()
            .copied()
            .filter(|item| basket.contains(item))
            .collect();
        for (position, &left) in present.iter().enumerate() {
            for &right in &present[position + 1..] {
                *pair_counts.entry((left, right)).or_insert(0) += 1;
            }
        }
    }

    let mut rules = Vec::new();
    for ((left, right), count) in &pair_counts {
        let support = *count as f64 / transaction_count;
        if support < config.min_support {
            continue;
        }
        for (antecedent, consequent) in [(*left, *right), (*right, *left)] {
            let antecedent_support = single_counts[antecedent] as f64 / transaction_count;
            let consequent_support = single_counts[consequent] as f64 / transaction_count;
            let confidence = support / antecedent_support;
            let lift = confidence / consequent_support;
            if lift > config.min_lift {
                rules.push(AssociationRule {
                    antecedent: vec![view.items[antecedent].0.clone()],
                    consequent: vec![view.items[consequent].0.clone()],
                    support,
                    confidence,
                    lift,
                });
            }
        }
    }

    rules.sort_by(|lhs, rhs| {
        rhs.lift
            .partial_cmp(&lhs.lift)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                rhs.confidence
                    .partial_cmp(&lhs.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| lhs.antecedent.cmp(&rhs.antecedent))
            .then_with(|| lhs.consequent.cmp(&rhs.consequent))
    });

    Ok(BasketMiningOutcome::Rules(rules))
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct BundleFamilyCount {
    pub name: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BundleUtilization {
    pub families: Vec<BundleFamilyCount>,
    pub total_bundles: i64,
    pub discounted: i64,
    /// Share of bundle sales that went through a coupon or a custom bundle;
    /// zero when no bundles were sold at all.
    pub discount_rate: f64,
}

/// Sales counts per bundle family, including the custom bundle counter.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn bundle_utilization(rows: &[LedgerRow], catalog: &Catalog) -> BundleUtilization {
    let column_total = |column: &str| -> i64 {
        rows.iter()
            .map(|row| row.quantities.get(column).copied().unwrap_or(0))
            .sum()
    };

    let mut families = Vec::new();
    let mut total_bundles = 0;
    let mut discounted = 0;
    for sku in catalog.skus() {
        if !sku.kind.is_bundle() {
            continue;
        }
        let count = column_total(&sku.name);
        total_bundles += count;
        if sku.kind == SkuKind::DiscountBundle {
            discounted += count;
        }
        families.push(BundleFamilyCount {
            name: sku.name.clone(),
            count,
        });
    }

    let adhoc = column_total(COL_ADHOC_BUNDLE);
    total_bundles += adhoc;
    discounted += adhoc;
    families.push(BundleFamilyCount {
        name: COL_ADHOC_BUNDLE.to_string(),
        count: adhoc,
    });

    let discount_rate = if total_bundles == 0 {
        0.0
    } else {
        discounted as f64 / total_bundles as f64
    };

    BundleUtilization {
        families,
        total_bundles,
        discounted,
        discount_rate,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CoPurchaseCount {
    pub name: String,
    pub count: i64,
}

/// Items bought alongside `target`, summed over the transactions containing
/// it and ranked descending. Zero counts are omitted.
///
/// # Errors
/// Returns [`RegisterError::UnknownSku`] when `target` is not an
/// analysis-relevant item, and [`RegisterError::Configuration`] for an
/// invalid coupon mapping.
pub fn co_purchase_counts(
    rows: &[LedgerRow],
    catalog: &Catalog,
    config: &AnalyticsConfig,
    target: &str,
) -> Result<Vec<CoPurchaseCount>, RegisterError> {
    let view = analysis_view(catalog, config)?;
    if !view.items.iter().any(|(name, _)| name == target) {
        return Err(RegisterError::UnknownSku(target.to_string()));
    }

    let mut totals: BTreeMap<&str, i64> = BTreeMap::new();
    for row in rows {
        let folded = view.folded_quantities(row);
        if folded.get(target).copied().unwrap_or(0) <= 0 {
            continue;
        }
        for (name, quantity) in folded {
            if name != target && quantity > 0 {
                *totals.entry(name).or_insert(0) += quantity;
            }
        }
    }

    let mut counts: Vec<CoPurchaseCount> = totals
        .into_iter()
        .map(|(name, count)| CoPurchaseCount {
            name: name.to_string(),
            count,
        })
        .collect();
    counts.sort_by(|lhs, rhs| rhs.count.cmp(&lhs.count).then_with(|| lhs.name.cmp(&rhs.name)));
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn must_err<T: std::fmt::Debug>(result: Result<T, RegisterError>) -> RegisterError {
        match result {
            Ok(value) => panic!("expected Err(..), got {value:?}"),
            Err(err) => err,
        }
    }

    fn fixture_timestamp(value: &str) -> OffsetDateTime {
        must_ok(parse_sheet_timestamp(value))
    }

    fn fixture_row(timestamp: &str, total: i64, quantities: &[(&str, i64)]) -> LedgerRow {
        LedgerRow {
            timestamp: fixture_timestamp(timestamp),
            transaction_id: Uuid::new_v4(),
            total_amount: total,
            quantities: quantities
                .iter()
                .map(|(name, quantity)| ((*name).to_string(), *quantity))
                .collect(),
        }
    }

    fn session_with(catalog: &Catalog, items: &[&str]) -> Session {
        let mut session = Session::new();
        for item in items {
            must_ok(session.add(catalog, item));
        }
        session
    }

    #[derive(Default)]
    struct MemoryLedgerStore {
        rows: Vec<Vec<String>>,
        fail_append: bool,
    }

    impl LedgerStore for MemoryLedgerStore {
        fn append(&mut self, cells: &[String]) -> Result<(), RegisterError> {
            if self.fail_append {
                return Err(RegisterError::StoreAppend("simulated outage".to_string()));
            }
            self.rows.push(cells.to_vec());
            Ok(())
        }

        fn read_all(&self) -> Result<RawTable, RegisterError> {
            Ok(RawTable {
                header: LedgerSchema::current().columns().to_vec(),
                rows: self.rows.clone(),
            })
        }
    }

    #[test]
    fn standard_catalog_validates() {
        must_ok(Catalog::standard().validate());
        must_ok(LedgerSchema::current().validate());
        must_ok(AnalyticsConfig::v1().validate());
    }

    #[test]
    fn catalog_rejects_duplicate_names() {
        let skus = vec![
            SkuRecord::base("ラムネ", 250, 80),
            SkuRecord::base("ラムネ", 300, 80),
        ];
        let err = must_err(Catalog::new(skus));
        assert!(matches!(err, RegisterError::Configuration(_)));
    }

    #[test]
    fn catalog_rejects_bundle_with_unknown_component() {
        let skus = vec![
            SkuRecord::base("ラムネ", 250, 80),
            SkuRecord::bundle("謎セット", 500, SkuKind::Bundle, &["ラムネ", "たこ焼き"]),
        ];
        let err = must_err(Catalog::new(skus));
        assert!(matches!(err, RegisterError::Configuration(_)));
    }

    #[test]
    fn catalog_rejects_negative_price() {
        let err = must_err(Catalog::new(vec![SkuRecord::base("ラムネ", -1, 80)]));
        assert!(matches!(err, RegisterError::Configuration(_)));
    }

    #[test]
    fn price_of_unknown_sku_is_an_error() {
        let catalog = Catalog::standard();
        let err = must_err(catalog.price("たこ焼き"));
        assert_eq!(err, RegisterError::UnknownSku("たこ焼き".to_string()));
    }

    #[test]
    fn add_of_unknown_sku_leaves_cart_unchanged() {
        let catalog = Catalog::standard();
        let mut session = Session::new();
        let err = must_err(session.add(&catalog, "たこ焼き"));
        assert!(matches!(err, RegisterError::UnknownSku(_)));
        assert!(session.is_empty());
    }

    #[test]
    fn custom_bundle_requires_components_and_positive_price() {
        let catalog = Catalog::standard();
        let mut session = Session::new();

        let err = must_err(session.define_custom_bundle(&catalog, &[], 400));
        assert!(matches!(err, RegisterError::InvalidBundle(_)));

        let err = must_err(session.define_custom_bundle(
            &catalog,
            &["ラムネ".to_string()],
            0,
        ));
        assert!(matches!(err, RegisterError::InvalidBundle(_)));
        assert!(session.custom_bundles().is_empty());
    }

    #[test]
    fn custom_bundle_rejects_non_base_components() {
        let catalog = Catalog::standard();
        let mut session = Session::new();
        let err = must_err(session.define_custom_bundle(
            &catalog,
            &["焼きそば&ラムネセット".to_string()],
            400,
        ));
        assert!(matches!(err, RegisterError::InvalidBundle(_)));
    }

    #[test]
    fn identical_custom_bundles_collapse_to_one_sku() {
        let catalog = Catalog::standard();
        let mut session = Session::new();
        let first = must_ok(session.define_custom_bundle(
            &catalog,
            &["缶ジュース".to_string(), "フランクフルト".to_string()],
            400,
        ));
        let second = must_ok(session.define_custom_bundle(
            &catalog,
            &["フランクフルト".to_string(), "缶ジュース".to_string()],
            400,
        ));
        assert_eq!(first, second);
        assert_eq!(session.custom_bundles().len(), 1);
    }

    #[test]
    fn total_recomputes_over_mixed_cart() {
        let catalog = Catalog::standard();
        let mut session = session_with(&catalog, &["焼きそば", "焼きそば&ラムネセット"]);
        let bundle = must_ok(session.define_custom_bundle(
            &catalog,
            &["フランクフルト".to_string(), "缶ジュース".to_string()],
            400,
        ));
        must_ok(session.add(&catalog, &bundle));
        assert_eq!(must_ok(session.total(&catalog)), 500 + 700 + 400);
    }

    #[test]
    fn grouped_preserves_first_occurrence_order() {
        let catalog = Catalog::standard();
        let session = session_with(&catalog, &["ラムネ", "焼きそば", "ラムネ", "焼きそば"]);
        let lines = must_ok(session.grouped(&catalog));
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].name, "ラムネ");
        assert_eq!(lines[0].quantity, 2);
        assert_eq!(lines[0].unit_price, 250);
        assert_eq!(lines[1].name, "焼きそば");
        assert_eq!(lines[1].quantity, 2);
    }

    #[test]
    fn clear_releases_custom_bundle_definitions() {
        let catalog = Catalog::standard();
        let mut session = Session::new();
        let bundle = must_ok(session.define_custom_bundle(
            &catalog,
            &["ラムネ".to_string()],
            200,
        ));
        must_ok(session.add(&catalog, &bundle));
        session.clear();
        assert!(session.is_empty());
        let err = must_err(session.add(&catalog, &bundle));
        assert!(matches!(err, RegisterError::UnknownSku(_)));
    }

    #[test]
    fn decompose_returns_self_for_base_and_components_for_bundles() {
        let catalog = Catalog::standard();
        let session = Session::new();
        assert_eq!(
            must_ok(session.decompose(&catalog, "ラムネ")),
            vec!["ラムネ".to_string()]
        );
        assert_eq!(
            must_ok(session.decompose(&catalog, "焼きそば&ラムネセット")),
            vec!["焼きそば".to_string(), "ラムネ".to_string()]
        );
    }

    #[test]
    fn encode_rejects_empty_cart() {
        let catalog = Catalog::standard();
        let session = Session::new();
        let err = must_err(encode_checkout(
            &session,
            &catalog,
            &LedgerSchema::current(),
            fixture_timestamp("2025-09-13 10:00:00"),
            Uuid::new_v4(),
        ));
        assert_eq!(err, RegisterError::EmptyCart);
    }

    #[test]
    fn encode_counts_base_items_and_totals() {
        let catalog = Catalog::standard();
        let session = session_with(&catalog, &["焼きそば", "焼きそば", "ラムネ"]);
        let row = must_ok(encode_checkout(
            &session,
            &catalog,
            &LedgerSchema::current(),
            fixture_timestamp("2025-09-13 10:00:00"),
            Uuid::new_v4(),
        ));
        assert_eq!(row.total_amount, 1250);
        assert_eq!(row.quantities.get("焼きそば"), Some(&2));
        assert_eq!(row.quantities.get("ラムネ"), Some(&1));
        assert_eq!(row.quantities.get("缶ジュース"), Some(&0));
        assert_eq!(row.quantities.get(COL_ADHOC_BUNDLE), Some(&0));
    }

    #[test]
    fn encode_increments_bundle_column_and_its_components() {
        let catalog = Catalog::standard();
        let session = session_with(&catalog, &["焼きそば&ラムネセット"]);
        let row = must_ok(encode_checkout(
            &session,
            &catalog,
            &LedgerSchema::current(),
            fixture_timestamp("2025-09-13 10:00:00"),
            Uuid::new_v4(),
        ));
        assert_eq!(row.total_amount, 700);
        assert_eq!(row.quantities.get("焼きそば&ラムネセット"), Some(&1));
        assert_eq!(row.quantities.get("焼きそば"), Some(&1));
        assert_eq!(row.quantities.get("ラムネ"), Some(&1));
    }

    #[test]
    fn encode_prices_discount_bundles_at_their_own_price() {
        let catalog = Catalog::standard();
        let session = session_with(&catalog, &["【特別割引券】焼きそば&ラムネセット"]);
        let row = must_ok(encode_checkout(
            &session,
            &catalog,
            &LedgerSchema::current(),
            fixture_timestamp("2025-09-13 10:00:00"),
            Uuid::new_v4(),
        ));
        assert_eq!(row.total_amount, 500);
        assert_eq!(
            row.quantities.get("【特別割引券】焼きそば&ラムネセット"),
            Some(&1)
        );
        assert_eq!(row.quantities.get("焼きそば"), Some(&1));
        assert_eq!(row.quantities.get("ラムネ"), Some(&1));
    }

    #[test]
    fn encode_routes_custom_bundles_through_the_adhoc_counter() {
        let catalog = Catalog::standard();
        let mut session = Session::new();
        let bundle = must_ok(session.define_custom_bundle(
            &catalog,
            &["フランクフルト".to_string(), "缶ジュース".to_string()],
            400,
        ));
        must_ok(session.add(&catalog, &bundle));
        let row = must_ok(encode_checkout(
            &session,
            &catalog,
            &LedgerSchema::current(),
            fixture_timestamp("2025-09-13 10:00:00"),
            Uuid::new_v4(),
        ));
        assert_eq!(row.total_amount, 400);
        assert_eq!(row.quantities.get(COL_ADHOC_BUNDLE), Some(&1));
        assert_eq!(row.quantities.get("フランクフルト"), Some(&1));
        assert_eq!(row.quantities.get("缶ジュース"), Some(&1));
    }

    #[test]
    fn encode_fails_when_an_item_has_no_ledger_column() {
        let catalog = Catalog::standard();
        let mut session = Session::new();
        let bundle = must_ok(session.define_custom_bundle(
            &catalog,
            &["ラムネ".to_string()],
            200,
        ));
        must_ok(session.add(&catalog, &bundle));
        // v1 predates the custom bundle counter.
        let err = must_err(encode_checkout(
            &session,
            &catalog,
            &LedgerSchema::v1(),
            fixture_timestamp("2025-09-13 10:00:00"),
            Uuid::new_v4(),
        ));
        assert!(matches!(err, RegisterError::SchemaMismatch(_)));
    }

    #[test]
    fn to_cells_follows_schema_order_and_zero_fills() {
        let catalog = Catalog::standard();
        let schema = LedgerSchema::current();
        let session = session_with(&catalog, &["ラムネ"]);
        let transaction_id = Uuid::new_v4();
        let row = must_ok(encode_checkout(
            &session,
            &catalog,
            &schema,
            fixture_timestamp("2025-09-13 10:00:00"),
            transaction_id,
        ));
        let cells = must_ok(to_cells(&row, &schema));
        assert_eq!(cells.len(), schema.columns().len());
        assert_eq!(cells[0], "2025-09-13 10:00:00");
        assert_eq!(cells[1], transaction_id.to_string());
        assert_eq!(cells[2], "250");
        assert_eq!(cells[3], "0");
        let ramune_position = schema
            .columns()
            .iter()
            .position(|column| column == "ラムネ");
        assert_eq!(cells[must_ok(ramune_position.ok_or("missing column"))], "1");
    }

    #[test]
    fn decode_ignores_unknown_trailing_columns() {
        let schema = LedgerSchema::v1();
        let mut header = schema.columns().to_vec();
        header.push("謎カラム".to_string());
        let mut row = vec!["2025-09-13 10:00:00".to_string(), Uuid::new_v4().to_string()];
        row.push("500".to_string());
        row.extend(std::iter::repeat("0".to_string()).take(7));
        row.push("99".to_string());

        let table = RawTable {
            header,
            rows: vec![row],
        };
        let decoded = decode_table(&table, &schema);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].total_amount, 500);
        assert!(!decoded[0].quantities.contains_key("謎カラム"));
    }

    #[test]
    fn decode_defaults_missing_columns_to_zero() {
        // Data written under v1, read with the current schema.
        let old = LedgerSchema::v1();
        let current = LedgerSchema::current();
        let mut row = vec![
            "2025-09-13 10:00:00".to_string(),
            Uuid::new_v4().to_string(),
            "500".to_string(),
            "1".to_string(),
        ];
        row.extend(std::iter::repeat("0".to_string()).take(old.columns().len() - 4));

        let table = RawTable {
            header: old.columns().to_vec(),
            rows: vec![row],
        };
        let decoded = decode_table(&table, &current);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].quantities.get("焼きそば"), Some(&1));
        assert_eq!(decoded[0].quantities.get(COL_ADHOC_BUNDLE), Some(&0));
    }

    #[test]
    fn decode_drops_padding_and_unparseable_timestamps() {
        let schema = LedgerSchema::v1();
        let blank = vec![String::new(); schema.columns().len()];
        let mut corrupt = vec![
            "メモ: 補充お願いします".to_string(),
            String::new(),
            "500".to_string(),
        ];
        corrupt.extend(std::iter::repeat("0".to_string()).take(7));
        let mut good = vec![
            "2025-09-13 10:00:00".to_string(),
            Uuid::new_v4().to_string(),
            "500".to_string(),
        ];
        good.extend(std::iter::repeat("0".to_string()).take(7));

        let table = RawTable {
            header: schema.columns().to_vec(),
            rows: vec![blank, corrupt, good],
        };
        let decoded = decode_table(&table, &schema);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].total_amount, 500);
    }

    #[test]
    fn decode_zero_fills_unparseable_numerics_and_keeps_order() {
        let schema = LedgerSchema::v1();
        let make_row = |stamp: &str, total: &str, yakisoba: &str| {
            let mut row = vec![stamp.to_string(), Uuid::new_v4().to_string(), total.to_string()];
            row.push(yakisoba.to_string());
            row.extend(std::iter::repeat("0".to_string()).take(6));
            row
        };

        let table = RawTable {
            header: schema.columns().to_vec(),
            rows: vec![
                make_row("2025-09-13 10:00:00", "500", "1"),
                make_row("2025-09-13 10:05:00", "n/a", "x"),
            ],
        };
        let decoded = decode_table(&table, &schema);
        assert_eq!(decoded.len(), 2);
        assert!(decoded[0].timestamp < decoded[1].timestamp);
        assert_eq!(decoded[1].total_amount, 0);
        assert_eq!(decoded[1].quantities.get("焼きそば"), Some(&0));
    }

    #[test]
    fn decode_accepts_rfc3339_timestamps() {
        let parsed = must_ok(parse_sheet_timestamp("2025-09-13T01:00:00Z"));
        assert_eq!(parsed, fixture_timestamp("2025-09-13 10:00:00"));
    }

    #[test]
    fn encode_decode_roundtrip_matches_cart() {
        let catalog = Catalog::standard();
        let schema = LedgerSchema::current();
        let carts: Vec<Vec<&str>> = vec![
            vec!["焼きそば", "焼きそば", "ラムネ"],
            vec!["焼きそば", "焼きそば&ラムネセット", "缶ジュース"],
            vec!["ラムネ", "ラムネ", "ラムネ"],
        ];

        for items in carts {
            let session = session_with(&catalog, &items);
            let row = must_ok(encode_checkout(
                &session,
                &catalog,
                &schema,
                fixture_timestamp("2025-09-13 10:00:00"),
                Uuid::new_v4(),
            ));
            let table = RawTable {
                header: schema.columns().to_vec(),
                rows: vec![must_ok(to_cells(&row, &schema))],
            };
            let decoded = decode_table(&table, &schema);
            assert_eq!(decoded.len(), 1);
            assert_eq!(decoded[0].total_amount, must_ok(session.total(&catalog)));
            assert_eq!(decoded[0].quantities, row.quantities);
            assert_eq!(decoded[0].transaction_id, row.transaction_id);
        }
    }

    #[test]
    fn roundtrip_covers_custom_bundles() {
        let catalog = Catalog::standard();
        let schema = LedgerSchema::current();
        let mut session = Session::new();
        let bundle = must_ok(session.define_custom_bundle(
            &catalog,
            &["フランクフルト".to_string(), "缶ジュース".to_string()],
            400,
        ));
        must_ok(session.add(&catalog, &bundle));
        let row = must_ok(encode(&session, &catalog, &schema));
        let table = RawTable {
            header: schema.columns().to_vec(),
            rows: vec![must_ok(to_cells(&row, &schema))],
        };
        let decoded = decode_table(&table, &schema);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].total_amount, 400);
        assert_eq!(decoded[0].quantities.get(COL_ADHOC_BUNDLE), Some(&1));
        assert_eq!(decoded[0].quantities.get("フランクフルト"), Some(&1));
    }

    #[test]
    fn checkout_appends_and_clears_the_session() {
        let catalog = Catalog::standard();
        let schema = LedgerSchema::current();
        let mut session = session_with(&catalog, &["焼きそば", "ラムネ"]);
        let mut store = MemoryLedgerStore::default();

        let receipt = must_ok(checkout(&mut session, &catalog, &schema, &mut store));
        assert_eq!(receipt.total_amount, 750);
        assert_eq!(receipt.lines.len(), 2);
        assert!(session.is_empty());
        assert_eq!(store.rows.len(), 1);

        let decoded = decode_table(&must_ok(store.read_all()), &schema);
        assert_eq!(decoded[0].total_amount, 750);
    }

    #[test]
    fn checkout_failure_leaves_the_cart_intact() {
        let catalog = Catalog::standard();
        let schema = LedgerSchema::current();
        let mut session = session_with(&catalog, &["焼きそば", "ラムネ"]);
        let mut store = MemoryLedgerStore {
            fail_append: true,
            ..MemoryLedgerStore::default()
        };

        let err = must_err(checkout(&mut session, &catalog, &schema, &mut store));
        assert!(matches!(err, RegisterError::StoreAppend(_)));
        assert_eq!(session.items().len(), 2);
        assert!(store.rows.is_empty());
    }

    #[test]
    fn summary_sums_exactly_and_handles_the_empty_ledger() {
        let catalog = Catalog::standard();
        let empty = summary(&[], &catalog);
        assert_eq!(empty.total_sales, 0);
        assert_eq!(empty.transaction_count, 0);
        assert!(empty.avg_ticket.abs() < f64::EPSILON);

        let rows = vec![fixture_row(
            "2025-09-13 10:00:00",
            1250,
            &[("焼きそば", 2), ("ラムネ", 1)],
        )];
        let result = summary(&rows, &catalog);
        assert_eq!(result.total_sales, 1250);
        assert_eq!(result.transaction_count, 1);
        assert!((result.avg_ticket - 1250.0).abs() < f64::EPSILON);
        // 2 * 180 + 1 * 80
        assert_eq!(result.total_cost, 440);
        assert_eq!(result.gross_profit, 810);
    }

    #[test]
    fn ranking_folds_coupons_and_excludes_the_adhoc_counter() {
        let catalog = Catalog::standard();
        let config = AnalyticsConfig::v1();
        let rows = vec![fixture_row(
            "2025-09-13 10:00:00",
            0,
            &[
                ("焼きそば", 2),
                ("ラムネ", 1),
                ("【経シス割引券】焼きそば&ラムネセット", 1),
                ("【特別割引券】焼きそば&ラムネセット", 1),
                (COL_ADHOC_BUNDLE, 5),
            ],
        )];

        let ranking = must_ok(item_ranking(&rows, &catalog, &config));
        assert_eq!(ranking.by_revenue[0].name, "焼きそば&ラムネセット");
        assert_eq!(ranking.by_revenue[0].quantity, 2);
        assert_eq!(ranking.by_revenue[0].revenue, 1400);
        assert_eq!(ranking.by_revenue[1].name, "焼きそば");
        assert_eq!(ranking.by_revenue[1].revenue, 1000);
        assert!(ranking
            .by_revenue
            .iter()
            .all(|item| item.name != COL_ADHOC_BUNDLE));
        assert!(ranking
            .by_revenue
            .iter()
            .all(|item| !item.name.contains("割引券")));
    }

    #[test]
    fn ranking_ties_preserve_catalog_order() {
        let catalog = Catalog::standard();
        let config = AnalyticsConfig::v1();
        let ranking = must_ok(item_ranking(&[], &catalog, &config));
        let names: Vec<&str> = ranking
            .by_quantity
            .iter()
            .map(|item| item.name.as_str())
            .collect();
        assert_eq!(
            names,
            vec![
                "焼きそば",
                "焼きとうもろこし",
                "フランクフルト",
                "ラムネ",
                "缶ジュース",
                "焼きそば&ラムネセット",
                "焼きそば&缶ジュースセット",
            ]
        );
    }

    #[test]
    fn trend_produces_a_dense_series_over_gaps() {
        let rows = vec![
            fixture_row("2025-09-13 10:07:00", 500, &[("焼きそば", 1)]),
            fixture_row("2025-09-13 10:50:00", 250, &[("ラムネ", 1)]),
        ];
        let buckets = must_ok(time_trend(&rows, 10));
        assert_eq!(buckets.len(), 6);
        assert_eq!(buckets[0].start, fixture_timestamp("2025-09-13 10:00:00"));
        assert_eq!(buckets[0].count, 1);
        assert_eq!(buckets[0].revenue, 500);
        for bucket in &buckets[1..5] {
            assert_eq!(bucket.count, 0);
            assert_eq!(bucket.revenue, 0);
        }
        assert_eq!(buckets[5].count, 1);
        assert_eq!(buckets[5].revenue, 250);
    }

    #[test]
    fn trend_rejects_widths_that_do_not_divide_an_hour() {
        let err = must_err(time_trend(&[], 7));
        assert!(matches!(err, RegisterError::Configuration(_)));
        assert!(must_ok(time_trend(&[], 30)).is_empty());
    }

    #[test]
    fn mining_reports_insufficient_data_below_the_threshold() {
        let catalog = Catalog::standard();
        let config = AnalyticsConfig::v1();
        let rows: Vec<LedgerRow> = (0..10)
            .map(|_| fixture_row("2025-09-13 10:00:00", 500, &[("焼きそば", 1)]))
            .collect();
        let outcome = must_ok(mine_rules(&rows, &catalog, &config));
        assert_eq!(
            outcome,
            BasketMiningOutcome::InsufficientData {
                have: 10,
                required: 11,
            }
        );
    }

    #[test]
    fn mining_finds_lifted_pairs_and_is_deterministic() {
        let catalog = Catalog::standard();
        let config = AnalyticsConfig::v1();
        let mut rows = Vec::new();
        for _ in 0..6 {
            rows.push(fixture_row(
                "2025-09-13 10:00:00",
                750,
                &[("焼きそば", 1), ("ラムネ", 1)],
            ));
        }
        for _ in 0..3 {
            rows.push(fixture_row("2025-09-13 10:10:00", 500, &[("焼きそば", 1)]));
        }
        for _ in 0..3 {
            rows.push(fixture_row("2025-09-13 10:20:00", 150, &[("缶ジュース", 1)]));
        }

        let outcome = must_ok(mine_rules(&rows, &catalog, &config));
        let BasketMiningOutcome::Rules(rules) = outcome else {
            panic!("expected rules, got insufficient data");
        };
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].antecedent, vec!["ラムネ".to_string()]);
        assert_eq!(rules[0].consequent, vec!["焼きそば".to_string()]);
        assert!((rules[0].confidence - 1.0).abs() < 1e-9);
        assert!((rules[0].lift - 4.0 / 3.0).abs() < 1e-9);
        assert!((rules[0].support - 0.5).abs() < 1e-9);

        let again = must_ok(mine_rules(&rows, &catalog, &config));
        assert_eq!(BasketMiningOutcome::Rules(rules), again);
    }

    #[test]
    fn utilization_counts_families_and_rates() {
        let catalog = Catalog::standard();
        let rows = vec![fixture_row(
            "2025-09-13 10:00:00",
            0,
            &[
                ("焼きそば&ラムネセット", 1),
                ("【特別割引券】焼きそば&ラムネセット", 1),
                (COL_ADHOC_BUNDLE, 1),
            ],
        )];
        let utilization = bundle_utilization(&rows, &catalog);
        assert_eq!(utilization.total_bundles, 3);
        assert_eq!(utilization.discounted, 2);
        assert!((utilization.discount_rate - 2.0 / 3.0).abs() < 1e-9);

        let empty = bundle_utilization(&[], &catalog);
        assert_eq!(empty.total_bundles, 0);
        assert!(empty.discount_rate.abs() < f64::EPSILON);
    }

    #[test]
    fn co_purchase_ranks_items_bought_with_the_target() {
        let catalog = Catalog::standard();
        let config = AnalyticsConfig::v1();
        let rows = vec![
            fixture_row(
                "2025-09-13 10:00:00",
                0,
                &[("焼きそば", 2), ("ラムネ", 1)],
            ),
            fixture_row("2025-09-13 10:10:00", 0, &[("焼きそば", 1)]),
            fixture_row(
                "2025-09-13 10:20:00",
                0,
                &[("ラムネ", 1), ("缶ジュース", 2)],
            ),
        ];

        let counts = must_ok(co_purchase_counts(&rows, &catalog, &config, "焼きそば"));
        assert_eq!(counts.len(), 1);
        assert_eq!(counts[0].name, "ラムネ");
        assert_eq!(counts[0].count, 1);

        let err = must_err(co_purchase_counts(&rows, &catalog, &config, "たこ焼き"));
        assert!(matches!(err, RegisterError::UnknownSku(_)));
    }

    #[test]
    fn analytics_config_bounds_are_enforced() {
        let mut config = AnalyticsConfig::v1();
        config.bucket_width_minutes = 7;
        assert!(matches!(
            must_err(config.validate()),
            RegisterError::Configuration(_)
        ));

        let mut config = AnalyticsConfig::v1();
        config.min_support = 1.5;
        assert!(config.validate().is_err());

        let mut config = AnalyticsConfig::v1();
        config.min_transactions = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn discount_bundle_without_mapping_is_a_configuration_error() {
        let catalog = Catalog::standard();
        let mut config = AnalyticsConfig::v1();
        config.coupon_map.remove("【特別割引券】焼きそば&ラムネセット");
        let err = must_err(item_ranking(&[], &catalog, &config));
        assert!(matches!(err, RegisterError::Configuration(_)));
    }
}
