//! Sensor classification engine.
//!
//! Maps the hub's arbitrarily named sensor entities into the canonical
//! [`ElectricalMetrics`] record. Instead of one tangle of nested
//! conditionals, the heuristics are an ordered table of named rules
//! ([`RULES`]), each evaluated for every accepted reading in a fixed,
//! documented order:
//!
//! 1. `power-factor`  — device class or keyword, dimensionless.
//! 2. `primary-power` — first non-total, non-phase power reading wins
//!    the `current_power` slot.
//! 3. `phase-power`   — phase-tagged power readings fill `phase_l*_power`.
//! 4. `energy-buckets`— today/month/import/export routing with an
//!    unmatched-reading fallback for `total_import`.
//! 5. `voltage`       — phase routing, first scalar reading wins.
//! 6. `current`       — same, for amperes.
//!
//! Category membership is a priority union of signals: an explicit
//! device-class tag wins, otherwise a recognized physical unit, otherwise
//! keyword presence in the entity's search text (English and Norwegian
//! vocabulary). A reading explicitly tagged or unit-marked as a different
//! category never qualifies through keywords alone.
//!
//! `classify` is pure and deterministic for a fixed input order, and a
//! malformed reading is skipped, never fatal.

use serde::Serialize;

use cabinlink_api::EntityState;

// ── Canonical record ─────────────────────────────────────────────────

/// Canonical electrical-metrics record, independent of source naming.
///
/// Every populated field is already unit-normalized (watts, kWh, volts,
/// amps). Absence is `None` and is dropped at serialization time, so the
/// portal never confuses "unset" with zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ElectricalMetrics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_power: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub today_usage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub month_usage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_import: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_export: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voltage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_amps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power_factor: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase_l1_voltage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase_l1_current: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase_l1_power: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase_l2_voltage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase_l2_current: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase_l2_power: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase_l3_voltage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase_l3_current: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase_l3_power: Option<f64>,
}

impl ElectricalMetrics {
    /// `true` when no reading qualified for any field.
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

// ── Readings ─────────────────────────────────────────────────────────

/// One accepted, pre-parsed sensor reading.
#[derive(Debug)]
struct Reading {
    value: f64,
    /// Lowercased identifier + friendly name, the keyword search text.
    text: String,
    device_class: Option<String>,
    unit: Option<String>,
}

impl Reading {
    /// Parse a raw entity state; `None` for unavailable or non-numeric
    /// states.
    fn from_state(state: &EntityState) -> Option<Self> {
        let raw = state.state.trim();
        if raw.is_empty()
            || raw.eq_ignore_ascii_case("unavailable")
            || raw.eq_ignore_ascii_case("unknown")
        {
            return None;
        }

        let value: f64 = raw.parse().ok().filter(|v: &f64| v.is_finite())?;

        let mut text = state.entity_id.to_lowercase();
        if let Some(name) = state.friendly_name() {
            text.push(' ');
            text.push_str(&name.to_lowercase());
        }

        Some(Self {
            value,
            text,
            device_class: state.device_class().map(str::to_lowercase),
            unit: state.unit().map(|u| u.trim().to_lowercase()),
        })
    }

    fn has_any(&self, keywords: &[&str]) -> bool {
        keywords.iter().any(|k| self.text.contains(k))
    }
}

// ── Categories ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Category {
    Power,
    Energy,
    Voltage,
    Current,
    PowerFactor,
}

/// Device classes and units the engine recognizes at all. A reading
/// tagged with one of these for a *different* category is never pulled
/// in through keywords alone.
const KNOWN_DEVICE_CLASSES: &[&str] = &["power", "energy", "voltage", "current", "power_factor"];
const KNOWN_UNITS: &[&str] = &["w", "kw", "wh", "kwh", "v", "a"];

impl Category {
    fn device_class(self) -> &'static str {
        match self {
            Self::Power => "power",
            Self::Energy => "energy",
            Self::Voltage => "voltage",
            Self::Current => "current",
            Self::PowerFactor => "power_factor",
        }
    }

    fn units(self) -> &'static [&'static str] {
        match self {
            Self::Power => &["w", "kw"],
            Self::Energy => &["wh", "kwh"],
            Self::Voltage => &["v"],
            Self::Current => &["a"],
            Self::PowerFactor => &[],
        }
    }

    fn keywords(self) -> &'static [&'static str] {
        match self {
            Self::Power => &["power", "effekt"],
            Self::Energy => &["energy", "kwh", "energi"],
            Self::Voltage => &["voltage", "spenning"],
            Self::Current => &["ampere", "current", "strøm", "strom"],
            Self::PowerFactor => &["power_factor", "power factor", "effektfaktor"],
        }
    }
}

/// Priority union: device class, then unit, then keyword. A mismatched
/// explicit tag or unit vetoes keyword qualification.
fn qualifies(reading: &Reading, category: Category) -> bool {
    if let Some(ref dc) = reading.device_class {
        if dc == category.device_class() {
            return true;
        }
        if KNOWN_DEVICE_CLASSES.contains(&dc.as_str()) {
            return false;
        }
    }

    if let Some(ref unit) = reading.unit {
        if category.units().contains(&unit.as_str()) {
            return true;
        }
        if KNOWN_UNITS.contains(&unit.as_str()) {
            return false;
        }
    }

    reading.has_any(category.keywords())
}

/// Normalize a qualifying reading to the record's implicit unit.
fn normalized(reading: &Reading, category: Category) -> f64 {
    match (category, reading.unit.as_deref()) {
        (Category::Power, Some("kw")) => reading.value * 1000.0,
        (Category::Energy, Some("wh")) => reading.value / 1000.0,
        _ => reading.value,
    }
}

// ── Phase detection ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    L1,
    L2,
    L3,
}

/// Detect an L1/L2/L3 phase marker, including the Norwegian "fase" form.
fn phase_of(reading: &Reading) -> Option<Phase> {
    const MARKERS: [(&[&str], Phase); 3] = [
        (&["l1", "phase_1", "phase1", "fase_1", "fase1"], Phase::L1),
        (&["l2", "phase_2", "phase2", "fase_2", "fase2"], Phase::L2),
        (&["l3", "phase_3", "phase3", "fase_3", "fase3"], Phase::L3),
    ];

    MARKERS
        .iter()
        .find(|(markers, _)| reading.has_any(markers))
        .map(|&(_, phase)| phase)
}

// ── Pass state ───────────────────────────────────────────────────────

/// Cross-reading bookkeeping for one classification pass.
#[derive(Debug, Default)]
struct PassState {
    /// First energy reading that matched no bucket keyword.
    energy_fallback: Option<f64>,
    /// An explicit import/consumption reading was seen.
    explicit_import: bool,
}

impl PassState {
    /// The first unmatched energy reading becomes the import total, but
    /// only if no explicit import reading appeared anywhere in the pass.
    fn finish(self, out: &mut ElectricalMetrics) {
        if !self.explicit_import && out.total_import.is_none() {
            out.total_import = self.energy_fallback;
        }
    }
}

// ── Rules ────────────────────────────────────────────────────────────

struct Rule {
    name: &'static str,
    apply: fn(&Reading, &mut ElectricalMetrics, &mut PassState),
}

/// The classification rules, in evaluation order.
const RULES: &[Rule] = &[
    Rule { name: "power-factor", apply: rule_power_factor },
    Rule { name: "primary-power", apply: rule_primary_power },
    Rule { name: "phase-power", apply: rule_phase_power },
    Rule { name: "energy-buckets", apply: rule_energy_buckets },
    Rule { name: "voltage", apply: rule_voltage },
    Rule { name: "current", apply: rule_current },
];

fn is_power_factor(reading: &Reading) -> bool {
    reading.device_class.as_deref() == Some("power_factor")
        || reading.has_any(Category::PowerFactor.keywords())
}

fn rule_power_factor(reading: &Reading, out: &mut ElectricalMetrics, _: &mut PassState) {
    if qualifies(reading, Category::PowerFactor) && out.power_factor.is_none() {
        out.power_factor = Some(reading.value);
    }
}

/// The primary present-power slot. Totals are aggregates, not live draw,
/// and phase legs have their own fields -- neither may claim the slot.
fn rule_primary_power(reading: &Reading, out: &mut ElectricalMetrics, _: &mut PassState) {
    if !qualifies(reading, Category::Power) || is_power_factor(reading) {
        return;
    }
    if reading.text.contains("total") && reading.text.contains("power") {
        return;
    }
    if phase_of(reading).is_some() {
        return;
    }
    if out.current_power.is_none() {
        out.current_power = Some(normalized(reading, Category::Power));
    }
}

fn rule_phase_power(reading: &Reading, out: &mut ElectricalMetrics, _: &mut PassState) {
    if !qualifies(reading, Category::Power) || is_power_factor(reading) {
        return;
    }
    let Some(phase) = phase_of(reading) else { return };

    let value = normalized(reading, Category::Power);
    let slot = match phase {
        Phase::L1 => &mut out.phase_l1_power,
        Phase::L2 => &mut out.phase_l2_power,
        Phase::L3 => &mut out.phase_l3_power,
    };
    if slot.is_none() {
        *slot = Some(value);
    }
}

const TODAY_KEYWORDS: &[&str] = &["today", "daily", "idag", "i_dag"];
const MONTH_KEYWORDS: &[&str] = &["month", "måned", "maaned", "maned"];
const IMPORT_KEYWORDS: &[&str] = &["import", "consumption", "forbruk"];
const EXPORT_KEYWORDS: &[&str] = &["export", "eksport"];

fn rule_energy_buckets(reading: &Reading, out: &mut ElectricalMetrics, pass: &mut PassState) {
    if !qualifies(reading, Category::Energy) {
        return;
    }
    let value = normalized(reading, Category::Energy);

    if reading.has_any(TODAY_KEYWORDS) {
        out.today_usage.get_or_insert(value);
    } else if reading.has_any(MONTH_KEYWORDS) {
        out.month_usage.get_or_insert(value);
    } else if reading.has_any(IMPORT_KEYWORDS) {
        pass.explicit_import = true;
        out.total_import.get_or_insert(value);
    } else if reading.has_any(EXPORT_KEYWORDS) {
        out.total_export.get_or_insert(value);
    } else if pass.energy_fallback.is_none() {
        pass.energy_fallback = Some(value);
    }
}

fn rule_voltage(reading: &Reading, out: &mut ElectricalMetrics, _: &mut PassState) {
    if !qualifies(reading, Category::Voltage) {
        return;
    }
    match phase_of(reading) {
        Some(Phase::L1) => {
            out.phase_l1_voltage.get_or_insert(reading.value);
        }
        Some(Phase::L2) => {
            out.phase_l2_voltage.get_or_insert(reading.value);
        }
        Some(Phase::L3) => {
            out.phase_l3_voltage.get_or_insert(reading.value);
        }
        None => {
            out.voltage.get_or_insert(reading.value);
        }
    }
}

fn rule_current(reading: &Reading, out: &mut ElectricalMetrics, _: &mut PassState) {
    if !qualifies(reading, Category::Current) {
        return;
    }
    match phase_of(reading) {
        Some(Phase::L1) => {
            out.phase_l1_current.get_or_insert(reading.value);
        }
        Some(Phase::L2) => {
            out.phase_l2_current.get_or_insert(reading.value);
        }
        Some(Phase::L3) => {
            out.phase_l3_current.get_or_insert(reading.value);
        }
        None => {
            out.current_amps.get_or_insert(reading.value);
        }
    }
}

// ── Entry point ──────────────────────────────────────────────────────

/// Classify a snapshot of entity states into a fresh canonical record.
///
/// Pure and deterministic: the same states in the same order always
/// produce the same record. Readings that are unavailable, unknown, or
/// non-numeric are skipped without failing the pass.
pub fn classify(states: &[EntityState]) -> ElectricalMetrics {
    let mut out = ElectricalMetrics::default();
    let mut pass = PassState::default();

    for state in states {
        let Some(reading) = Reading::from_state(state) else {
            continue;
        };
        for rule in RULES {
            (rule.apply)(&reading, &mut out, &mut pass);
        }
    }

    pass.finish(&mut out);
    out
}

/// The rule names in evaluation order, for diagnostics.
pub fn rule_names() -> impl Iterator<Item = &'static str> {
    RULES.iter().map(|r| r.name)
}

// ── Tests ────────────────────────────────────────────────────────────
