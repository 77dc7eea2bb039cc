use litwatch_schemas::{RawRecord, TermCandidate};
use regex::{Regex, RegexBuilder};
use std::collections::HashMap;
use tracing::debug;

use crate::term_index::normalize_term;

/// Terms kept per record when more match
pub const MAX_TERMS_PER_RECORD: usize = 8;

/// Matches too broad to discriminate between records in this corpus
const EXCLUDED_TERMS: &[&str] = &[
    "ACUTE MYELOID LEUKEMIA",
    "AML",
    "LEUKEMIA",
    "CANCER",
    "TUMOR",
    "CELL",
    "CELLS",
    "PATIENT",
    "PATIENTS",
    "TREATMENT",
    "THERAPY",
];

/// (category, pattern) pairs; every pattern is matched case-insensitively
const PATTERNS: &[(&str, &str)] = &[
    // Genes and proteins
    ("gene", r"\b(TP53|p53|MDM2|ASXL1|DNMT3A|TET2|IDH1|IDH2|NPM1|FLT3|CEBPA|RUNX1|KIT|NRAS|KRAS)\b"),
    ("gene", r"\b(BCL2|MCL1|BAX|BAK|PUMA|NOXA|p21|p16|RB1|E2F1)\b"),
    // Drugs and treatments
    ("drug", r"\b(venetoclax|azacitidine|decitabine|cytarabine|daunorubicin|idarubicin|mitoxantrone)\b"),
    ("drug", r"\b(tetrandrine|CPX-351|gemtuzumab|midostaurin|gilteritinib|quizartinib)\b"),
    ("treatment", r"\b(allogeneic|autologous|transplantation|HSCT|chemotherapy|hypomethylating)\b"),
    // Clinical outcomes
    ("outcome", r"\b(overall survival|progression-free survival|relapse-free survival|event-free survival)\b"),
    ("response", r"\b(complete remission|partial remission|refractory|relapsed|minimal residual disease)\b"),
    ("cytogenetics", r"\b(cytogenetics|complex karyotype|monosomal karyotype|karyotype)\b"),
    ("diagnostics", r"\b(blast count|bone marrow|peripheral blood|flow cytometry)\b"),
    // Molecular mechanisms
    ("mechanism", r"\b(apoptosis|cell cycle|DNA damage|DNA repair|oxidative stress)\b"),
    ("epigenetics", r"\b(demethylation|methylation|epigenetic|chromatin|transcription)\b"),
    ("pathway", r"\b(signaling pathway|tumor suppressor|oncogene|mutation|wild-type)\b"),
    // Research techniques
    ("technique", r"\b(qPCR|RT-PCR|western blot|immunofluorescence|CRISPR|RNA-seq|ChIP-seq)\b"),
    ("model", r"\b(cell culture|xenograft|mouse model|in vitro|in vivo)\b"),
    // Clinical classifications
    ("classification", r"\b(ELN risk|WHO classification|FAB classification|cytogenetic risk)\b"),
    ("subtype", r"\b(therapy-related|secondary AML|de novo|myelodysplastic syndrome)\b"),
];

/// Catalogue-driven term extractor. Deterministic and offline.
pub struct PatternTermExtractor {
    patterns: Vec<(&'static str, Regex)>,
    max_terms: usize,
}

impl Default for PatternTermExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl PatternTermExtractor {
    pub fn new() -> Self {
        let patterns = PATTERNS
            .iter()
            .map(|(category, pattern)| {
                let regex = RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .unwrap();
                (*category, regex)
            })
            .collect();

        Self {
            patterns,
            max_terms: MAX_TERMS_PER_RECORD,
        }
    }

    pub fn with_max_terms(mut self, max_terms: usize) -> Self {
        self.max_terms = max_terms;
        self
    }

    /// Terms found in the title and abstract of `record`, most frequent
    /// first, capped at the configured maximum
    pub fn extract(&self, record: &RawRecord) -> Vec<TermCandidate> {
        let text = format!("{} {}", record.title, record.abstract_text);

        // term -> (occurrences, category of first match)
        let mut found: HashMap<String, (usize, &'static str)> = HashMap::new();
        for (category, regex) in &self.patterns {
            for m in regex.find_iter(&text) {
                let Some(term) = normalize_term(m.as_str()) else {
                    continue;
                };
                if EXCLUDED_TERMS.contains(&term.as_str()) {
                    continue;
                }
                found.entry(term).or_insert((0, category)).0 += 1;
            }
        }

        let mut ranked: Vec<(String, usize, &'static str)> = found
            .into_iter()
            .map(|(term, (count, category))| (term, count, category))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(self.max_terms);

        debug!(
            "Pattern extractor found {} terms in record {}",
            ranked.len(),
            record.external_id
        );

        ranked
            .into_iter()
            .map(|(term, count, category)| TermCandidate {
                term,
                category: Some(category.to_string()),
                weight: Some(count as f32),
            })
            .collect()
    }
}
