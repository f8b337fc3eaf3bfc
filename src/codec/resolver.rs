use chrono::{NaiveDate, Utc};

use crate::codec::{Prefix, DEFAULT_PREFIX};

/// One row of the category table.
#[derive(Debug, Clone, Copy)]
pub struct CategoryEntry {
    pub label: &'static str,
    pub prefix: &'static str,
    /// Electronic counterpart used after the numbering-era cutover.
    pub electronic: Option<&'static str>,
}

const fn entry(label: &'static str, prefix: &'static str, electronic: Option<&'static str>) -> CategoryEntry {
    CategoryEntry {
        label,
        prefix,
        electronic,
    }
}

/// Known document categories and their prefixes.
pub const CATEGORY_TABLE: &[CategoryEntry] = &[
    entry("Factura de Crédito Fiscal", "B01", Some("E31")),
    entry("Crédito Fiscal", "B01", Some("E31")),
    entry("Factura de Consumo", "B02", Some("E32")),
    entry("Consumo", "B02", Some("E32")),
    entry("Nota de Débito", "B03", Some("E33")),
    entry("Nota de Crédito", "B04", Some("E34")),
    entry("Comprobante de Compras", "B11", Some("E41")),
    entry("Compras", "B11", Some("E41")),
    entry("Registro Único de Ingresos", "B12", None),
    entry("Gastos Menores", "B13", Some("E43")),
    entry("Regímenes Especiales", "B14", Some("E44")),
    entry("Gubernamental", "B15", Some("E45")),
    entry("Exportaciones", "B16", Some("E46")),
    entry("Pagos al Exterior", "B17", Some("E47")),
    entry("Factura de Crédito Fiscal Electrónica", "E31", None),
    entry("Factura de Consumo Electrónica", "E32", None),
    entry("Nota de Débito Electrónica", "E33", None),
    entry("Nota de Crédito Electrónica", "E34", None),
    entry("Compras Electrónico", "E41", None),
    entry("Gastos Menores Electrónico", "E43", None),
    entry("Regímenes Especiales Electrónico", "E44", None),
    entry("Gubernamental Electrónico", "E45", None),
    entry("Exportaciones Electrónico", "E46", None),
    entry("Pagos al Exterior Electrónico", "E47", None),
];

/// Maps free-text document categories to prefixes. Never fails.
#[derive(Debug, Clone, Default)]
pub struct PrefixResolver {
    /// First day on which categories resolve to their electronic prefix.
    electronic_cutover: Option<NaiveDate>,
}

impl PrefixResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_electronic_cutover(cutover: NaiveDate) -> Self {
        Self {
            electronic_cutover: Some(cutover),
        }
    }

    /// Reads `FISCSEQ_ELECTRONIC_CUTOVER` (`YYYY-MM-DD`). Invalid values are
    /// ignored.
    pub fn from_env() -> Self {
        let electronic_cutover = std::env::var("FISCSEQ_ELECTRONIC_CUTOVER")
            .ok()
            .and_then(|v| NaiveDate::parse_from_str(v.trim(), "%Y-%m-%d").ok());
        Self { electronic_cutover }
    }

    pub fn electronic_cutover(&self) -> Option<NaiveDate> {
        self.electronic_cutover
    }

    /// Resolves a prefix for today.
    pub fn resolve(&self, category: &str, explicit_prefix: Option<&str>) -> Prefix {
        self.resolve_on(category, explicit_prefix, Utc::now().date_naive())
    }

    /// Resolves a prefix as of `date`.
    ///
    /// An explicit prefix of at least three characters wins outright. Else
    /// the category is matched exactly, then by case-insensitive containment
    /// in either direction, then the default applies.
    pub fn resolve_on(&self, category: &str, explicit_prefix: Option<&str>, date: NaiveDate) -> Prefix {
        if let Some(explicit) = explicit_prefix.map(str::trim).filter(|p| p.chars().count() >= 3) {
            return Prefix::normalize(explicit);
        }

        let Some(entry) = lookup(category) else {
            tracing::debug!(category = %category, default = %DEFAULT_PREFIX, "unknown category, using default prefix");
            return DEFAULT_PREFIX;
        };

        let electronic_era = self.electronic_cutover.is_some_and(|cutover| date >= cutover);
        let chosen = match entry.electronic {
            Some(electronic) if electronic_era => electronic,
            _ => entry.prefix,
        };
        Prefix::normalize(chosen)
    }

    /// Returns the canonical table label for a prefix.
    pub fn label_for(prefix: Prefix) -> Option<&'static str> {
        let text = prefix.to_string();
        CATEGORY_TABLE.iter().find(|e| e.prefix == text).map(|e| e.label)
    }

    /// All distinct prefixes named by the table.
    pub fn known_prefixes() -> Vec<Prefix> {
        let mut prefixes: Vec<Prefix> = CATEGORY_TABLE
            .iter()
            .filter_map(|e| Prefix::parse(e.prefix).ok())
            .collect();
        prefixes.sort();
        prefixes.dedup();
        prefixes
    }
}

fn lookup(category: &str) -> Option<&'static CategoryEntry> {
    let trimmed = category.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Some(exact) = CATEGORY_TABLE.iter().find(|e| e.label == trimmed) {
        return Some(exact);
    }

    // Most specific label mentioned by the text, else the closest label
    // that mentions the text.
    let needle = trimmed.to_lowercase();
    CATEGORY_TABLE
        .iter()
        .filter(|e| needle.contains(&e.label.to_lowercase()))
        .max_by_key(|e| e.label.chars().count())
        .or_else(|| {
            CATEGORY_TABLE
                .iter()
                .filter(|e| e.label.to_lowercase().contains(&needle))
                .min_by_key(|e| e.label.chars().count())
        })
}
