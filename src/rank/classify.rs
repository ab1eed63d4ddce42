//! Product-description content classifier.
//!
//! Case-insensitive word-boundary patterns over the `product` annotation;
//! a hyphen on either side of a word counts as a boundary. The category
//! order is fixed: it drives the stable `content` strings of the ranking.

use lazy_static::lazy_static;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use strum::EnumIter;

/// Content categories, in the fixed reporting order.
#[derive(Clone, Copy, Debug, Deserialize, EnumIter, Eq, Ord, PartialEq, PartialOrd, Serialize)]
pub enum Category {
    TRna,
    Sm,
    Regulatory,
    Resistance,
    Transport,
    Mobile,
    Phage,
    Crispr,
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Category::TRna => "tRNA",
            Category::Sm => "SM",
            Category::Regulatory => "regulatory",
            Category::Resistance => "resistance",
            Category::Transport => "transport",
            Category::Mobile => "mobile",
            Category::Phage => "phage",
            Category::Crispr => "CRISPR",
        };
        write!(f, "{name}")
    }
}

fn pattern(re: &str) -> Regex {
    RegexBuilder::new(re)
        .case_insensitive(true)
        .build()
        .unwrap_or_else(|_| panic!("Invalid product pattern: {re}"))
}

lazy_static! {
    static ref MOBILE: Regex = pattern(
        r"\b(insertion|mobile[- ]element|integrase|excisionase|plasmid|DNA[- ]ligase|transposase|transfer[- ]protein|Spd[ABCD])\b"
    );
    static ref PHAGE: Regex = pattern(r"\b(pro-?)?phage\b");
    static ref CRISPR: Regex = pattern(r"\bCRISPR\b");
    static ref REGULATORY: Regex = pattern(r"\b(regulat|repress)(or|ory|ion)\b");
    static ref TRANSPORT: Regex = pattern(r"\b(transport(er|ing)?|export|permease|efflux)\b");
    static ref RESISTANCE: Regex = pattern(r"\bresistance\b");
    static ref SM: Regex = pattern(
        r"\b(PKS|polyketide|beta[- ]?lactamase|penicillin|antibiotic|acyl[- ]?carrier|.+[cd]in|.+phenazine|chitin(ase)?)\b"
    );
}

impl Category {
    /// Whether a product description matches this category. `TRna` is
    /// feature-based, never matched from text.
    pub fn matches(&self, product: &str) -> bool {
        match self {
            Category::TRna => false,
            Category::Sm => SM.is_match(product),
            Category::Regulatory => REGULATORY.is_match(product),
            Category::Resistance => RESISTANCE.is_match(product),
            Category::Transport => TRANSPORT.is_match(product),
            Category::Mobile => MOBILE.is_match(product),
            Category::Phage => PHAGE.is_match(product),
            Category::Crispr => CRISPR.is_match(product),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mobile_patterns() {
        for product in [
            "IS5 family insertion sequence",
            "putative integrase",
            "Mobile-element protein",
            "conjugal transfer protein TraB",
            "SpdB2 protein",
        ] {
            assert!(Category::Mobile.matches(product), "{product}");
        }
        assert!(!Category::Mobile.matches("ribosomal protein S1"));
    }

    #[test]
    fn phage_accepts_prophage_forms() {
        assert!(Category::Phage.matches("prophage integrase"));
        assert!(Category::Phage.matches("pro-phage terminase"));
        assert!(Category::Phage.matches("phage tail fiber"));
        assert!(!Category::Phage.matches("macrophage infectivity factor"));
    }

    #[test]
    fn crispr_accepts_hyphenated_forms() {
        assert!(Category::Crispr.matches("CRISPR-associated endonuclease Cas9"));
        assert!(Category::Crispr.matches("crispr repeat region"));
    }

    #[test]
    fn regulatory_forms() {
        for product in
            ["transcriptional regulator", "regulatory protein", "repressor LexA", "repression modulator"]
        {
            assert!(Category::Regulatory.matches(product), "{product}");
        }
        assert!(!Category::Regulatory.matches("regular protein"));
    }

    #[test]
    fn transport_forms() {
        for product in ["ABC transporter", "sugar transport system", "drug efflux pump", "amino acid permease", "export pump"] {
            assert!(Category::Transport.matches(product), "{product}");
        }
    }

    #[test]
    fn secondary_metabolism_forms() {
        for product in [
            "type I PKS",
            "polyketide synthase",
            "beta-lactamase",
            "betalactamase family protein",
            "antibiotic biosynthesis monooxygenase",
            "acyl carrier protein",
            "actinomycin synthetase",
            "Spd-cin cluster protein",
            "endophenazine biosynthesis protein",
            "chitinase C",
        ] {
            assert!(Category::Sm.matches(product), "{product}");
        }
        assert!(!Category::Sm.matches("protein of unknown function"));
    }

    #[test]
    fn trna_never_matches_text() {
        assert!(!Category::TRna.matches("tRNA-Leu"));
    }
}
