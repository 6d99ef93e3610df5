use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};

use crate::{AdapterError, RetrievalError};

/// Job-file description of one extraction strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractorSpec {
    /// Text content of every element matching `selector`, in document order.
    Text { selector: String },
    /// Value of `attr` on every element matching `selector`.
    Attribute { selector: String, attr: String },
}

impl ExtractorSpec {
    pub fn build(&self) -> Result<Box<dyn Extractor>, AdapterError> {
        match self {
            ExtractorSpec::Text { selector } => Ok(Box::new(SelectorText {
                source: selector.clone(),
                selector: parse_selector(selector)?,
            })),
            ExtractorSpec::Attribute { selector, attr } => Ok(Box::new(SelectorAttribute {
                source: selector.clone(),
                selector: parse_selector(selector)?,
                attr: attr.clone(),
            })),
        }
    }
}

/// One entry per matched element, in document order. Blank elements yield an
/// empty string so later values keep their position.
pub trait Extractor: Send + Sync {
    fn describe(&self) -> String;

    fn extract(&self, document: &Html) -> Vec<String>;
}

fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Message(format!("invalid selector `{selector}`: {e}")))
}

struct SelectorText {
    source: String,
    selector: Selector,
}

impl Extractor for SelectorText {
    fn describe(&self) -> String {
        format!("text({})", self.source)
    }

    fn extract(&self, document: &Html) -> Vec<String> {
        document
            .select(&self.selector)
            .map(|n| n.text().collect::<String>().trim().to_string())
            .collect()
    }
}

struct SelectorAttribute {
    source: String,
    selector: Selector,
    attr: String,
}

impl Extractor for SelectorAttribute {
    fn describe(&self) -> String {
        format!("attr({}@{})", self.source, self.attr)
    }

    fn extract(&self, document: &Html) -> Vec<String> {
        document
            .select(&self.selector)
            .map(|n| n.value().attr(&self.attr).map(str::trim).unwrap_or_default().to_string())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extracted {
    pub strategy: String,
    pub values: Vec<String>,
}

/// Ordered fallback list: the first extractor yielding at least `min_values`
/// non-empty values wins.
pub struct ExtractorChain {
    extractors: Vec<Box<dyn Extractor>>,
    min_values: usize,
}

impl ExtractorChain {
    pub fn new(extractors: Vec<Box<dyn Extractor>>, min_values: usize) -> Result<Self, AdapterError> {
        if extractors.is_empty() {
            return Err(AdapterError::Message(
                "extraction chain needs at least one extractor".to_string(),
            ));
        }
        Ok(Self {
            extractors,
            min_values: min_values.max(1),
        })
    }

    pub fn from_specs(specs: &[ExtractorSpec], min_values: usize) -> Result<Self, AdapterError> {
        let extractors = specs
            .iter()
            .map(ExtractorSpec::build)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(extractors, min_values)
    }

    pub fn min_values(&self) -> usize {
        self.min_values
    }

    pub fn extract(&self, html: &str) -> Result<Extracted, RetrievalError> {
        let document = Html::parse_document(html);
        let mut best = 0usize;
        for extractor in &self.extractors {
            let values = extractor.extract(&document);
            let filled = values.iter().filter(|v| !v.is_empty()).count();
            if filled >= self.min_values {
                return Ok(Extracted {
                    strategy: extractor.describe(),
                    values,
                });
            }
            best = best.max(filled);
        }
        Err(RetrievalError::MissingContent(format!(
            "best of {} strategies found {best} values, need {}",
            self.extractors.len(),
            self.min_values
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <html><body>
          <div class="valueValue apply-common-tooltip">1.2B</div>
          <div class="valueValue apply-common-tooltip">&#8722;3.4%</div>
          <div class="valueValue apply-common-tooltip">  </div>
          <span data-v="10"></span><span data-v="20"></span><span data-v="30"></span>
        </body></html>
    "#;

    fn text(selector: &str) -> ExtractorSpec {
        ExtractorSpec::Text {
            selector: selector.to_string(),
        }
    }

    #[test]
    fn first_sufficient_strategy_wins() {
        let chain = ExtractorChain::from_specs(&[text("div.valueValue"), text("span")], 2).unwrap();
        let extracted = chain.extract(PAGE).unwrap();
        assert_eq!(extracted.strategy, "text(div.valueValue)");
        assert_eq!(extracted.values, vec!["1.2B", "\u{2212}3.4%", ""]);
    }

    #[test]
    fn blank_cells_keep_their_position() {
        let page = r#"<div class="v">1</div><div class="v"> </div><div class="v">3</div>
            <i data-x="a"></i><i></i><i data-x=" c "></i>"#;
        let chain = ExtractorChain::from_specs(&[text("div.v")], 2).unwrap();
        assert_eq!(chain.extract(page).unwrap().values, vec!["1", "", "3"]);

        let chain = ExtractorChain::from_specs(
            &[ExtractorSpec::Attribute {
                selector: "i".into(),
                attr: "data-x".into(),
            }],
            2,
        )
        .unwrap();
        assert_eq!(chain.extract(page).unwrap().values, vec!["a", "", "c"]);

        // Blank cells do not count towards the minimum.
        let strict = ExtractorChain::from_specs(&[text("div.v")], 3).unwrap();
        assert!(matches!(strict.extract(page), Err(RetrievalError::MissingContent(_))));
    }

    #[test]
    fn falls_back_when_earlier_strategy_is_short() {
        let chain = ExtractorChain::from_specs(
            &[
                text("div.valueValue"),
                ExtractorSpec::Attribute {
                    selector: "span[data-v]".into(),
                    attr: "data-v".into(),
                },
            ],
            3,
        )
        .unwrap();
        let extracted = chain.extract(PAGE).unwrap();
        assert_eq!(extracted.values, vec!["10", "20", "30"]);
    }

    #[test]
    fn insufficient_everywhere_is_missing_content() {
        let chain = ExtractorChain::from_specs(&[text("div.valueValue")], 10).unwrap();
        assert!(matches!(
            chain.extract(PAGE),
            Err(RetrievalError::MissingContent(_))
        ));
    }

    #[test]
    fn bad_selectors_and_empty_chains_are_rejected() {
        assert!(ExtractorChain::from_specs(&[text("div[")], 1).is_err());
        assert!(ExtractorChain::from_specs(&[], 1).is_err());
    }
}
