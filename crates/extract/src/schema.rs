use serde::{Deserialize, Serialize};
use std::fmt;

/// Literal written for any cell without an extracted value.
pub const NA: &str = "NA";

macro_rules! columns {
    ($($variant:ident => $name:literal),+ $(,)?) => {
        /// The fixed output schema, in export order.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum Column {
            $($variant),+
        }

        impl Column {
            pub const ALL: &'static [Column] = &[$(Column::$variant),+];

            pub fn name(self) -> &'static str {
                match self {
                    $(Column::$variant => $name),+
                }
            }
        }
    };
}

columns! {
    IdStudy => "Idstudy",
    IdEstimate => "IdEstimate",
    Author => "Author",
    AuthorAffiliation => "Author_Affiliation",
    Doi => "DOI",
    JournalName => "Journal_Name",
    NumCitations => "Num_Citations",
    Year => "Year",
    BaseModelType => "Base_Model_Type",
    AugmentedBaseModel => "Augmented_base_model",
    AugmentationDescription => "Augmentation_Description",
    RamseyRule => "Ramsey_Rule",
    HhIncluded => "HH_Included",
    FirmsIncluded => "Firms_Included",
    BanksIncluded => "Banks_Included",
    GovernmentIncluded => "Government_Included",
    HhMaximizationType => "HH_Maximization_Type",
    HhMaximizedVars => "HH_Maximized_Vars",
    ProducerType => "Producer_Type",
    ProducerAssumption => "Producer_Assumption",
    OtherAgentIncluded => "Other_Agent_Included",
    OtherAgentAssumptions => "Other_Agent_Assumptions",
    EmpiricalResearch => "Empirical_Research",
    Country => "Country",
    FlexiblePriceAssumption => "Flexible_Price_Assumption",
    ExogenousInflation => "Exogenous_Inflation",
    HouseholdsDiscountFactor => "Households_discount_factor",
    ConsumptionCurvature => "Consumption_curvature_parameter",
    DisutilityOfLabor => "Disutility_of_labor",
    InverseLaborSupplyElasticity => "Inverse_of_labor_supply_elasticity",
    MoneyCurvature => "Money_curvature_parameter",
    LoanToValueRatio => "Loan_to_value_ratio",
    LaborShareOfOutput => "Labor_share_of_output",
    DepositorsDiscountFactor => "Depositors_discount_factor",
    PriceAdjustmentCost => "Price_adjustment_cost",
    ElasticityOfSubstitution => "Elasticity_of_substitution_between_goods",
    Ar1CoefficientOfTfp => "AR1_coefficient_of_TFP",
    StdDevTfpShock => "Std_dev_to_TFP_shock",
    ZeroLowerBound => "Zero_Lower_Bound",
    ResultsTable => "Results_Table",
    ResultsInflation => "Results_Inflation",
    ResultsInflationAssumption => "Results_Inflation_Assumption",
    PreferredEstimate => "Preferred_Estimate",
    ReasonForPreferred => "Reason_for_Preferred",
    StdDevInflation => "Std_Dev_Inflation",
    InterestRate => "Interest_Rate",
    ImpactFactor => "Impact_Factor",
}

pub const COLUMN_COUNT: usize = 47;

/// How a column's values are checked when rows are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Identity,
    Text,
    Integer,
    Binary,
    Numeric,
}

/// Which stage is responsible for a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnOwner {
    Identity,
    Metadata,
    Structure,
    Results,
    /// Asked at study level by the structure stage and per outcome by the
    /// results stage.
    Shared,
}

impl Column {
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_name(name: &str) -> Option<Column> {
        Column::ALL.iter().copied().find(|c| c.name() == name)
    }

    pub fn kind(self) -> ValueKind {
        use Column::*;
        match self {
            IdStudy | IdEstimate => ValueKind::Identity,
            Year | NumCitations => ValueKind::Integer,
            HhIncluded | FirmsIncluded | BanksIncluded | GovernmentIncluded | EmpiricalResearch
            | FlexiblePriceAssumption | ExogenousInflation | ZeroLowerBound | PreferredEstimate => {
                ValueKind::Binary
            }
            HouseholdsDiscountFactor | ConsumptionCurvature | DisutilityOfLabor
            | InverseLaborSupplyElasticity | MoneyCurvature | LoanToValueRatio
            | LaborShareOfOutput | DepositorsDiscountFactor | PriceAdjustmentCost
            | ElasticityOfSubstitution | Ar1CoefficientOfTfp | StdDevTfpShock
            | ResultsInflation | StdDevInflation | InterestRate => ValueKind::Numeric,
            _ => ValueKind::Text,
        }
    }

    pub fn owner(self) -> ColumnOwner {
        use Column::*;
        match self {
            IdStudy => ColumnOwner::Identity,
            Author | AuthorAffiliation | Doi | JournalName | NumCitations | Year
            | BaseModelType | Country | ImpactFactor => ColumnOwner::Metadata,
            AugmentedBaseModel | AugmentationDescription | RamseyRule | HhIncluded
            | FirmsIncluded | BanksIncluded | GovernmentIncluded | HhMaximizationType
            | HhMaximizedVars | ProducerType | ProducerAssumption | OtherAgentIncluded
            | OtherAgentAssumptions | EmpiricalResearch => ColumnOwner::Structure,
            FlexiblePriceAssumption | ExogenousInflation | ZeroLowerBound => ColumnOwner::Shared,
            _ => ColumnOwner::Results,
        }
    }

    /// Human-readable sentinel used instead of "NA" when the source was
    /// searched and the value is known to be absent.
    pub fn not_found_label(self) -> Option<&'static str> {
        match self {
            Column::AuthorAffiliation => Some("Cannot find affiliation"),
            _ => None,
        }
    }

    /// Columns a stage is asked to fill.
    pub fn owned_by_metadata(self) -> bool {
        self.owner() == ColumnOwner::Metadata
    }

    pub fn owned_by_structure(self) -> bool {
        matches!(self.owner(), ColumnOwner::Structure | ColumnOwner::Shared)
    }

    pub fn owned_by_results(self) -> bool {
        self == Column::IdEstimate || matches!(self.owner(), ColumnOwner::Results | ColumnOwner::Shared)
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Tab-separated header line the tabular stages are asked to emit.
pub fn header_line() -> String {
    Column::ALL
        .iter()
        .map(|c| c.name())
        .collect::<Vec<_>>()
        .join("\t")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Missing {
    Unknown,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cell {
    Value(String),
    Missing(Missing),
}

impl Default for Cell {
    fn default() -> Self {
        Cell::Missing(Missing::Unknown)
    }
}

impl Cell {
    pub fn value(text: impl Into<String>) -> Self {
        Cell::Value(text.into())
    }

    /// Interpret raw model output for one field.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        let lowered = trimmed.to_ascii_lowercase();

        if trimmed.is_empty() || matches!(lowered.as_str(), "na" | "n/a" | "null" | "none" | "nan") {
            Cell::Missing(Missing::Unknown)
        } else if lowered.starts_with("cannot find") {
            Cell::Missing(Missing::NotFound)
        } else {
            Cell::Value(trimmed.to_string())
        }
    }

    pub fn as_value(&self) -> Option<&str> {
        match self {
            Cell::Value(v) => Some(v),
            Cell::Missing(_) => None,
        }
    }

    pub fn is_present(&self) -> bool {
        matches!(self, Cell::Value(_))
    }

    /// Apply an incoming cell: a real value always replaces, an explicit
    /// not-found only replaces unknown.
    pub fn overlay(&mut self, incoming: &Cell) {
        match incoming {
            Cell::Value(_) => *self = incoming.clone(),
            Cell::Missing(Missing::NotFound) if *self == Cell::Missing(Missing::Unknown) => {
                *self = incoming.clone();
            }
            Cell::Missing(_) => {}
        }
    }

    pub fn render(&self, column: Column) -> String {
        match self {
            Cell::Value(v) => v.clone(),
            Cell::Missing(Missing::NotFound) => column.not_found_label().unwrap_or(NA).to_string(),
            Cell::Missing(Missing::Unknown) => NA.to_string(),
        }
    }
}

/// One output row; holds exactly one cell per schema column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Cell>", into = "Vec<Cell>")]
pub struct ExtractedRow {
    cells: Vec<Cell>,
}

impl TryFrom<Vec<Cell>> for ExtractedRow {
    type Error = String;

    fn try_from(cells: Vec<Cell>) -> Result<Self, Self::Error> {
        if cells.len() != COLUMN_COUNT {
            return Err(format!("expected {} cells, got {}", COLUMN_COUNT, cells.len()));
        }
        Ok(Self { cells })
    }
}

impl From<ExtractedRow> for Vec<Cell> {
    fn from(row: ExtractedRow) -> Self {
        row.cells
    }
}

impl Default for ExtractedRow {
    fn default() -> Self {
        Self::missing()
    }
}

impl ExtractedRow {
    pub fn missing() -> Self {
        Self {
            cells: vec![Cell::default(); COLUMN_COUNT],
        }
    }

    /// The single all-"NA" row emitted for a study with nothing extracted.
    pub fn placeholder(study_id: u32) -> Self {
        let mut row = Self::missing();
        row.set(Column::IdStudy, Cell::value(study_id.to_string()));
        row.set(Column::IdEstimate, Cell::value("1"));
        row
    }

    /// Build from positional fields; `None` unless there is one per column.
    pub fn from_fields<S: AsRef<str>>(fields: &[S]) -> Option<Self> {
        if fields.len() != COLUMN_COUNT {
            return None;
        }
        Some(Self {
            cells: fields.iter().map(|f| Cell::parse(f.as_ref())).collect(),
        })
    }

    pub fn get(&self, column: Column) -> &Cell {
        &self.cells[column.index()]
    }

    pub fn set(&mut self, column: Column, cell: Cell) {
        self.cells[column.index()] = cell;
    }

    pub fn value(&self, column: Column) -> Option<&str> {
        self.get(column).as_value()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Column, &Cell)> {
        Column::ALL.iter().copied().zip(self.cells.iter())
    }

    pub fn populated_count(&self, filter: impl Fn(Column) -> bool) -> usize {
        self.iter()
            .filter(|(column, cell)| filter(*column) && cell.is_present())
            .count()
    }

    pub fn render(&self) -> Vec<String> {
        self.iter().map(|(column, cell)| cell.render(column)).collect()
    }
}

/// Final rows of a run, in study order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub rows: Vec<ExtractedRow>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header() -> Vec<&'static str> {
        Column::ALL.iter().map(|c| c.name()).collect()
    }

    pub fn extend_study(&mut self, rows: Vec<ExtractedRow>) {
        self.rows.extend(rows);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn study_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        for row in &self.rows {
            if let Some(id) = row.value(Column::IdStudy) {
                if ids.last().map(String::as_str) != Some(id) {
                    ids.push(id.to_string());
                }
            }
        }
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_has_47_unique_columns() {
        assert_eq!(Column::ALL.len(), COLUMN_COUNT);
        for (index, column) in Column::ALL.iter().enumerate() {
            assert_eq!(column.index(), index);
            assert_eq!(Column::from_name(column.name()), Some(*column));
        }
        assert_eq!(Column::ResultsInflation.index(), 40);
        assert_eq!(Column::ImpactFactor.index(), 46);
    }

    #[test]
    fn test_ownership_overlaps_only_on_shared_columns() {
        for column in Column::ALL {
            let owners = [
                column.owned_by_metadata(),
                column.owned_by_structure(),
                column.owned_by_results(),
            ]
            .iter()
            .filter(|o| **o)
            .count();

            match column {
                Column::IdStudy => assert_eq!(owners, 0),
                Column::FlexiblePriceAssumption | Column::ExogenousInflation | Column::ZeroLowerBound => {
                    assert_eq!(owners, 2)
                }
                _ => assert_eq!(owners, 1, "{} should have one owner", column),
            }
        }
    }

    #[test]
    fn test_cell_parse_sentinels() {
        assert_eq!(Cell::parse(" NA "), Cell::Missing(Missing::Unknown));
        assert_eq!(Cell::parse(""), Cell::Missing(Missing::Unknown));
        assert_eq!(Cell::parse("Cannot find affiliation"), Cell::Missing(Missing::NotFound));
        assert_eq!(Cell::parse(" 0.99"), Cell::value("0.99"));
    }

    #[test]
    fn test_not_found_renders_per_column() {
        let not_found = Cell::Missing(Missing::NotFound);

        assert_eq!(not_found.render(Column::AuthorAffiliation), "Cannot find affiliation");
        assert_eq!(not_found.render(Column::Doi), "NA");
    }

    #[test]
    fn test_overlay_precedence() {
        let mut cell = Cell::default();
        cell.overlay(&Cell::Missing(Missing::NotFound));
        assert_eq!(cell, Cell::Missing(Missing::NotFound));

        cell.overlay(&Cell::value("MIT"));
        assert_eq!(cell, Cell::value("MIT"));

        cell.overlay(&Cell::Missing(Missing::NotFound));
        cell.overlay(&Cell::default());
        assert_eq!(cell, Cell::value("MIT"));
    }

    #[test]
    fn test_row_requires_full_width() {
        assert!(ExtractedRow::from_fields(&["1", "2"]).is_none());

        let fields = vec!["NA"; COLUMN_COUNT];
        let row = ExtractedRow::from_fields(&fields).unwrap();
        assert_eq!(row.populated_count(|_| true), 0);
    }

    #[test]
    fn test_row_serde_rejects_wrong_width() {
        let row = ExtractedRow::placeholder(3);
        let json = serde_json::to_string(&row).unwrap();
        let back: ExtractedRow = serde_json::from_str(&json).unwrap();
        assert_eq!(back, row);

        assert!(serde_json::from_str::<ExtractedRow>("[]").is_err());
    }
}
