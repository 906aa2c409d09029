use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::io::Read;

use serde::{Deserialize, Deserializer, Serialize};

use super::domain::ResultFlag;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("failed to read catalog csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("catalog row {row}: invalid {field} '{value}'")]
    InvalidField {
        row: usize,
        field: &'static str,
        value: String,
    },
    #[error("test {code} is listed with conflicting {field}")]
    Conflict { code: String, field: &'static str },
    #[error("catalog contains no tests")]
    Empty,
    #[error("unknown test code '{0}'")]
    UnknownTest(String),
    #[error("order total exceeds the largest billable amount")]
    QuoteOverflow,
}

/// A measured component of a test together with its reference interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyteDefinition {
    pub name: String,
    pub unit: String,
    pub reference_low: Option<f64>,
    pub reference_high: Option<f64>,
}

impl AnalyteDefinition {
    fn new(name: &str, unit: &str, low: Option<f64>, high: Option<f64>) -> Self {
        Self {
            name: name.to_string(),
            unit: unit.to_string(),
            reference_low: low,
            reference_high: high,
        }
    }

    pub fn flag(&self, value: &str) -> ResultFlag {
        let Ok(measured) = value.trim().parse::<f64>() else {
            return ResultFlag::Unflagged;
        };
        if !measured.is_finite() {
            return ResultFlag::Unflagged;
        }

        match (self.reference_low, self.reference_high) {
            (None, None) => ResultFlag::Unflagged,
            (Some(low), _) if measured < low => ResultFlag::Low,
            (_, Some(high)) if measured > high => ResultFlag::High,
            _ => ResultFlag::Normal,
        }
    }

    pub fn reference_range(&self) -> Option<String> {
        match (self.reference_low, self.reference_high) {
            (Some(low), Some(high)) => Some(format!("{low}-{high}")),
            (Some(low), None) => Some(format!("> {low}")),
            (None, Some(high)) => Some(format!("< {high}")),
            (None, None) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestDefinition {
    pub code: String,
    pub name: String,
    /// Price in minor currency units.
    pub price: u32,
    pub analytes: Vec<AnalyteDefinition>,
    pub requires_assessment: bool,
}

impl TestDefinition {
    pub fn analyte(&self, name: &str) -> Option<&AnalyteDefinition> {
        self.analytes
            .iter()
            .find(|analyte| analyte.name.eq_ignore_ascii_case(name.trim()))
    }
}

/// Orderable tests keyed by upper-case code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCatalog {
    tests: BTreeMap<String, TestDefinition>,
}

impl TestCatalog {
    /// Built-in menu used when no catalog file is configured.
    pub fn standard() -> Self {
        let tests = vec![
            TestDefinition {
                code: "FBC".to_string(),
                name: "Full Blood Count".to_string(),
                price: 8_500,
                analytes: vec![
                    AnalyteDefinition::new("Haemoglobin", "g/dL", Some(12.0), Some(17.5)),
                    AnalyteDefinition::new("White Cell Count", "x10^9/L", Some(4.0), Some(11.0)),
                    AnalyteDefinition::new("Platelets", "x10^9/L", Some(150.0), Some(450.0)),
                ],
                requires_assessment: false,
            },
            TestDefinition {
                code: "MP".to_string(),
                name: "Malaria Parasite".to_string(),
                price: 2_500,
                analytes: vec![AnalyteDefinition::new("Parasites", "", None, None)],
                requires_assessment: false,
            },
            TestDefinition {
                code: "FBS".to_string(),
                name: "Fasting Blood Sugar".to_string(),
                price: 3_000,
                analytes: vec![AnalyteDefinition::new(
                    "Glucose",
                    "mmol/L",
                    Some(3.9),
                    Some(5.6),
                )],
                requires_assessment: false,
            },
            TestDefinition {
                code: "LIPID".to_string(),
                name: "Lipid Profile".to_string(),
                price: 12_000,
                analytes: vec![
                    AnalyteDefinition::new("Total Cholesterol", "mmol/L", None, Some(5.2)),
                    AnalyteDefinition::new("HDL", "mmol/L", Some(1.0), None),
                    AnalyteDefinition::new("LDL", "mmol/L", None, Some(3.4)),
                    AnalyteDefinition::new("Triglycerides", "mmol/L", None, Some(1.7)),
                ],
                requires_assessment: false,
            },
            TestDefinition {
                code: "PSY".to_string(),
                name: "Psychometric Screen".to_string(),
                price: 15_000,
                analytes: vec![
                    AnalyteDefinition::new("PHQ-9", "points", Some(0.0), Some(4.0)),
                    AnalyteDefinition::new("GAD-7", "points", Some(0.0), Some(4.0)),
                ],
                requires_assessment: true,
            },
        ];

        let tests = tests
            .into_iter()
            .map(|test| (test.code.clone(), test))
            .collect();
        Self { tests }
    }

    /// Load a catalog from CSV, one row per analyte.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self, CatalogError> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);
        let mut tests: BTreeMap<String, TestDefinition> = BTreeMap::new();

        for (index, row) in csv_reader.deserialize::<CatalogRow>().enumerate() {
            let row = row?;
            // header is line 1
            let line = index + 2;
            let code = normalize_code(&row.code);
            if code.is_empty() {
                return Err(CatalogError::InvalidField {
                    row: line,
                    field: "code",
                    value: row.code,
                });
            }

            if row.analyte.trim().is_empty() {
                return Err(CatalogError::InvalidField {
                    row: line,
                    field: "analyte",
                    value: row.analyte,
                });
            }

            let price = row
                .price
                .trim()
                .parse::<u32>()
                .map_err(|_| CatalogError::InvalidField {
                    row: line,
                    field: "price",
                    value: row.price.clone(),
                })?;
            let low = parse_bound(row.low.as_deref(), line, "low")?;
            let high = parse_bound(row.high.as_deref(), line, "high")?;
            let requires_assessment = parse_flag(row.requires_assessment.as_deref());
            let analyte =
                AnalyteDefinition::new(&row.analyte, row.unit.as_deref().unwrap_or(""), low, high);

            match tests.entry(code.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(TestDefinition {
                        code,
                        name: row.name,
                        price,
                        analytes: vec![analyte],
                        requires_assessment,
                    });
                }
                Entry::Occupied(mut slot) => {
                    let test = slot.get_mut();
                    if test.price != price {
                        return Err(CatalogError::Conflict {
                            code,
                            field: "price",
                        });
                    }
                    if test.requires_assessment != requires_assessment {
                        return Err(CatalogError::Conflict {
                            code,
                            field: "assessment requirement",
                        });
                    }
                    if test.analyte(&analyte.name).is_some() {
                        return Err(CatalogError::InvalidField {
                            row: line,
                            field: "analyte",
                            value: analyte.name,
                        });
                    }
                    test.analytes.push(analyte);
                }
            }
        }

        if tests.is_empty() {
            return Err(CatalogError::Empty);
        }
        Ok(Self { tests })
    }

    pub fn get(&self, code: &str) -> Option<&TestDefinition> {
        self.tests.get(&normalize_code(code))
    }

    pub fn require(&self, code: &str) -> Result<&TestDefinition, CatalogError> {
        self.get(code)
            .ok_or_else(|| CatalogError::UnknownTest(code.trim().to_string()))
    }

    /// Total price for the given codes.
    pub fn quote(&self, codes: &[String]) -> Result<u32, CatalogError> {
        codes.iter().try_fold(0u32, |total, code| {
            let test = self.require(code)?;
            total
                .checked_add(test.price)
                .ok_or(CatalogError::QuoteOverflow)
        })
    }

    pub fn tests(&self) -> impl Iterator<Item = &TestDefinition> {
        self.tests.values()
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }
}

impl Default for TestCatalog {
    fn default() -> Self {
        Self::standard()
    }
}

pub(crate) fn normalize_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

#[derive(Debug, Deserialize)]
struct CatalogRow {
    #[serde(rename = "Code")]
    code: String,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Price")]
    price: String,
    #[serde(rename = "Analyte")]
    analyte: String,
    #[serde(rename = "Unit", default, deserialize_with = "empty_string_as_none")]
    unit: Option<String>,
    #[serde(rename = "Low", default, deserialize_with = "empty_string_as_none")]
    low: Option<String>,
    #[serde(rename = "High", default, deserialize_with = "empty_string_as_none")]
    high: Option<String>,
    #[serde(
        rename = "Requires Assessment",
        default,
        deserialize_with = "empty_string_as_none"
    )]
    requires_assessment: Option<String>,
}

fn empty_string_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let opt = Option::<String>::deserialize(deserializer)?;
    Ok(opt.filter(|value| !value.trim().is_empty()))
}

fn parse_bound(
    raw: Option<&str>,
    row: usize,
    field: &'static str,
) -> Result<Option<f64>, CatalogError> {
    match raw {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|bound| bound.is_finite())
            .map(Some)
            .ok_or_else(|| CatalogError::InvalidField {
                row,
                field,
                value: value.to_string(),
            }),
    }
}

fn parse_flag(raw: Option<&str>) -> bool {
    matches!(
        raw.map(|value| value.trim().to_ascii_lowercase()).as_deref(),
        Some("yes" | "y" | "true" | "1")
    )
}
