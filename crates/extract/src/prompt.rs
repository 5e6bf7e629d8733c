use crate::schema::{Column, header_line};
use crate::triage::TriageResult;

/// Which wording a stage attempt uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateVariant {
    Standard,
    Simplified,
}

pub fn build_triage_prompt(start_page: u32, end_page: u32) -> String {
    format!(
        r#"You are screening pages {start}-{end} of an academic paper on monetary economics.

TASK:
1. Decide whether these pages report optimal or steady-state inflation results.
2. List the PDF page numbers (between {start} and {end}) holding inflation result tables,
   model parameter / calibration tables, or text with numerical inflation results.
3. Extract basic bibliographic information if it appears on these pages.
4. Estimate how many distinct inflation results and parameter values are reported.

OUTPUT FORMAT (JSON):
```json
{{
  "has_inflation_data": true,
  "confidence_score": 0.0,
  "relevant_pdf_positions": [],
  "tables_with_inflation": ["descriptions"],
  "parameter_tables": ["descriptions"],
  "parameter_locations": ["descriptions"],
  "basic_info": {{
    "author": "Smith, J. (2023)",
    "author_affiliation": "Harvard University",
    "year": "2023",
    "journal": "Journal of Monetary Economics",
    "model_type": "NK-DSGE",
    "doi": "10.xxxx/xxxx",
    "country": "USA"
  }},
  "estimated_inflation_values": 0,
  "estimated_parameter_values": 0
}}
```

Return ONLY valid JSON."#,
        start = start_page,
        end = end_page
    )
}

pub fn build_metadata_prompt(triage: &TriageResult) -> String {
    let mut prompt = String::from(
        "Extract study identification and bibliographic metadata from the attached paper.\n\n",
    );
    prompt.push_str(&column_instructions(Column::owned_by_metadata));
    prompt.push_str(&seed_hints(triage));
    prompt.push_str(&table_instructions(1));
    prompt
}

pub fn build_structure_prompt(triage: &TriageResult) -> String {
    let mut prompt = String::from(
        "Describe the model structure of the attached paper: base model, agents included, \
         household and producer assumptions, price flexibility and the zero lower bound.\n\
         Binary indicators must be 0 or 1.\n\n",
    );
    prompt.push_str(&column_instructions(Column::owned_by_structure));
    if !triage.parameter_locations.is_empty() {
        prompt.push_str(&format!(
            "Model details are likely found in: {}\n\n",
            triage.parameter_locations.join("; ")
        ));
    }
    prompt.push_str(&table_instructions(1));
    prompt
}

pub fn build_results_prompt(triage: &TriageResult, variant: TemplateVariant) -> String {
    let mut prompt = match variant {
        TemplateVariant::Standard => {
            let mut text = String::from(
                "Extract every optimal inflation result reported in the attached pages, one row per \
                 result, together with the calibrated model parameters used for that result.\n\
                 Numbers must be decimals (2% is 0.02). Do not include variances or standard \
                 deviations of inflation as results.\n\n",
            );
            text.push_str(&column_instructions(Column::owned_by_results));
            text
        }
        TemplateVariant::Simplified => String::from(
            "Extract ONLY the inflation results from the attached pages.\n\
             For each result give IdEstimate (1, 2, 3...), Results_Table, Results_Inflation (decimal), \
             Flexible_Price_Assumption (1 flexible, 0 sticky), Zero_Lower_Bound (1 or 0) and \
             Results_Inflation_Assumption (brief description).\n\
             Fill all 47 columns but focus on the inflation values; use NA for anything else.\n\n",
        ),
    };

    if !triage.target_tables.is_empty() {
        prompt.push_str(&format!(
            "Results are likely in: {}\n",
            triage.target_tables.join("; ")
        ));
    }
    if triage.estimated_row_count > 0 {
        prompt.push_str(&format!(
            "Screening suggests about {} results (a hint, not a requirement).\n",
            triage.estimated_row_count
        ));
    }
    prompt.push('\n');
    prompt.push_str(&table_instructions(0));
    prompt
}

fn column_instructions(owned: fn(Column) -> bool) -> String {
    let names: Vec<&str> = Column::ALL
        .iter()
        .copied()
        .filter(|c| owned(*c))
        .map(Column::name)
        .collect();
    format!("Fill these columns: {}\n\n", names.join(", "))
}

fn seed_hints(triage: &TriageResult) -> String {
    if triage.preliminary_values.is_empty() {
        return String::new();
    }
    let hints: Vec<String> = triage
        .preliminary_values
        .iter()
        .map(|(column, value)| format!("{} = {}", column.name(), value))
        .collect();
    format!("Screening found (verify before use): {}\n\n", hints.join("; "))
}

fn table_instructions(rows: usize) -> String {
    let row_rule = if rows == 1 {
        "Output exactly one data row.".to_string()
    } else {
        "Output one data row per result.".to_string()
    };
    format!(
        "OUTPUT FORMAT:\nA tab-separated table with this header line, then data rows with all 47 fields.\n\
         {}\nUse NA for any value not reported in the paper.\n\n{}\n",
        row_rule,
        header_line()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_triage_prompt_names_page_range() {
        let prompt = build_triage_prompt(11, 20);

        assert!(prompt.contains("pages 11-20"));
        assert!(prompt.contains("\"relevant_pdf_positions\""));
    }

    #[test]
    fn test_results_prompt_carries_soft_count_hint() {
        let triage = TriageResult {
            has_target_data: true,
            estimated_row_count: 3,
            target_tables: vec!["Table 2".to_string()],
            ..TriageResult::default()
        };
        let prompt = build_results_prompt(&triage, TemplateVariant::Standard);

        assert!(prompt.contains("about 3 results"));
        assert!(prompt.contains("Table 2"));
        assert!(prompt.contains(&header_line()));
    }

    #[test]
    fn test_metadata_prompt_lists_only_metadata_columns() {
        let prompt = build_metadata_prompt(&TriageResult::default());
        let fill_line = prompt.lines().find(|l| l.starts_with("Fill these columns")).unwrap();

        assert!(fill_line.contains("Author_Affiliation"));
        assert!(!fill_line.contains("Results_Inflation"));
    }
}
