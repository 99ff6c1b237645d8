//! Facet filter evaluator.
//!
//! Two surface syntaxes describe the same logical model and are both
//! normalized onto one internal [`FilterExpr`] tree, so evaluation has a
//! single code path:
//!
//! 1. **Flat dict** (JSON object): facet name → expression string. Facet
//!    keys are AND-ed; inside an expression `|` separates OR groups, `&`
//!    separates AND-ed atoms, a leading `!` negates an atom.
//! 2. **XML tree**: nested `AND` / `OR` / `CONDITION` elements
//!    (case-insensitive tags). A `CONDITION` tests one variable
//!    (`STAINING`, `SPECIES`, `ANATOMICAL_SITE`) against a literal value.
//!
//! An atom matches when its value is present in the item's facet value list
//! or the paired `_code` list; a negated atom matches when absent from both.
//! Logical nodes with zero children are rejected at parse time.

use serde_json::Value;

use crate::error::{Result, RetrievalError};
use crate::metadata::{FacetField, FacetRecord};
use crate::xmlutil::Element;

/// Internal boolean-expression tree over facet atoms.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterExpr {
    And(Vec<FilterExpr>),
    Or(Vec<FilterExpr>),
    Atom {
        facet: FacetField,
        value: String,
        negated: bool,
    },
}

impl FilterExpr {
    /// Evaluates the expression against one resolved facet record.
    pub fn matches(&self, record: &FacetRecord) -> bool {
        match self {
            Self::And(children) => children.iter().all(|c| c.matches(record)),
            Self::Or(children) => children.iter().any(|c| c.matches(record)),
            Self::Atom {
                facet,
                value,
                negated,
            } => record.contains(*facet, value) != *negated,
        }
    }

    /// Parses the flat-dict syntax from a JSON object.
    pub fn parse_flat(conditions: &Value) -> Result<Self> {
        let map = conditions
            .as_object()
            .ok_or_else(|| RetrievalError::UnknownFilterSyntax {
                reason: "flat filter must be a JSON object of facet -> expression".to_string(),
            })?;
        if map.is_empty() {
            return Err(RetrievalError::UnknownFilterSyntax {
                reason: "flat filter has no conditions".to_string(),
            });
        }

        let mut keys = Vec::new();
        for (key, expr) in map {
            let facet = FacetField::parse(key)?;
            let expr = expr
                .as_str()
                .ok_or_else(|| RetrievalError::UnknownFilterSyntax {
                    reason: format!("expression for facet '{key}' must be a string"),
                })?;
            keys.push(parse_expression(facet, expr)?);
        }
        Ok(collapse(FilterExpr::And, keys))
    }

    /// Parses the XML tree syntax. `root` is the filter document's root
    /// element; its children combine as OR.
    pub fn parse_tree(root: &Element) -> Result<Self> {
        let children = parse_tree_children(root)?;
        if children.is_empty() {
            return Err(RetrievalError::UnknownFilterSyntax {
                reason: format!("filter element <{}> has no children", root.tag),
            });
        }
        Ok(collapse(FilterExpr::Or, children))
    }
}

/// One facet expression string: `|` OR groups of `&`-joined atoms.
fn parse_expression(facet: FacetField, expr: &str) -> Result<FilterExpr> {
    let mut groups = Vec::new();
    for group in expr.split('|') {
        let mut atoms = Vec::new();
        for atom in group.split('&') {
            let atom = atom.trim();
            let (value, negated) = match atom.strip_prefix('!') {
                Some(rest) => (rest, true),
                None => (atom, false),
            };
            if value.is_empty() {
                return Err(RetrievalError::UnknownFilterSyntax {
                    reason: format!("empty atom in expression '{expr}' for facet '{}'", facet.as_str()),
                });
            }
            atoms.push(FilterExpr::Atom {
                facet,
                value: value.to_string(),
                negated,
            });
        }
        groups.push(collapse(FilterExpr::And, atoms));
    }
    Ok(collapse(FilterExpr::Or, groups))
}

fn parse_tree_children(elem: &Element) -> Result<Vec<FilterExpr>> {
    elem.children.iter().map(parse_tree_node).collect()
}

fn parse_tree_node(elem: &Element) -> Result<FilterExpr> {
    match elem.tag.to_uppercase().as_str() {
        "AND" => {
            let children = parse_tree_children(elem)?;
            if children.is_empty() {
                return Err(RetrievalError::UnknownFilterSyntax {
                    reason: "AND node has no children".to_string(),
                });
            }
            Ok(collapse(FilterExpr::And, children))
        }
        "OR" => {
            let children = parse_tree_children(elem)?;
            if children.is_empty() {
                return Err(RetrievalError::UnknownFilterSyntax {
                    reason: "OR node has no children".to_string(),
                });
            }
            Ok(collapse(FilterExpr::Or, children))
        }
        "CONDITION" => {
            let variable =
                elem.attr("variable")
                    .ok_or_else(|| RetrievalError::UnknownFilterSyntax {
                        reason: "CONDITION without a 'variable' attribute".to_string(),
                    })?;
            let value = elem
                .attr("value")
                .ok_or_else(|| RetrievalError::UnknownFilterSyntax {
                    reason: format!("CONDITION on '{variable}' without a 'value' attribute"),
                })?;
            Ok(FilterExpr::Atom {
                facet: condition_variable(variable)?,
                value: value.to_string(),
                negated: false,
            })
        }
        other => Err(RetrievalError::UnknownFilterSyntax {
            reason: format!("unknown filter tag <{other}>, expected AND, OR or CONDITION"),
        }),
    }
}

const CONDITION_VARIABLES: &[&str] = &["STAINING", "SPECIES", "ANATOMICAL_SITE"];

fn condition_variable(variable: &str) -> Result<FacetField> {
    match variable.to_uppercase().as_str() {
        "STAINING" => Ok(FacetField::Staining),
        "SPECIES" => Ok(FacetField::Species),
        "ANATOMICAL_SITE" => Ok(FacetField::Organ),
        _ => Err(RetrievalError::UnknownVariant {
            what: "condition variable",
            key: variable.to_string(),
            known: CONDITION_VARIABLES,
        }),
    }
}

/// Single-child logical nodes collapse to that child.
fn collapse(ctor: fn(Vec<FilterExpr>) -> FilterExpr, mut children: Vec<FilterExpr>) -> FilterExpr {
    if children.len() == 1 {
        children.pop().expect("one child")
    } else {
        ctor(children)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xmlutil::parse_document;
    use serde_json::json;

    fn he_record() -> FacetRecord {
        FacetRecord {
            staining: vec!["HE".to_string()],
            species: vec!["homo sapiens".to_string()],
            organ: vec!["skin".to_string()],
            staining_code: vec!["SC-001".to_string()],
            ..FacetRecord::default()
        }
    }

    #[test]
    fn flat_or_includes_when_one_branch_matches() {
        let expr = FilterExpr::parse_flat(&json!({"staining": "HE|PAS"})).unwrap();
        assert!(expr.matches(&he_record()));
    }

    #[test]
    fn flat_negation_excludes_present_value() {
        let expr = FilterExpr::parse_flat(&json!({"staining": "!HE"})).unwrap();
        assert!(!expr.matches(&he_record()));
    }

    #[test]
    fn flat_and_requires_all_atoms() {
        let expr = FilterExpr::parse_flat(&json!({"staining": "HE&PAS"})).unwrap();
        assert!(!expr.matches(&he_record()));
    }

    #[test]
    fn flat_facet_keys_are_anded() {
        let both = FilterExpr::parse_flat(&json!({"staining": "HE", "organ": "skin"})).unwrap();
        assert!(both.matches(&he_record()));

        let wrong_organ =
            FilterExpr::parse_flat(&json!({"staining": "HE", "organ": "liver"})).unwrap();
        assert!(!wrong_organ.matches(&he_record()));
    }

    #[test]
    fn atom_matches_paired_code_list() {
        let expr = FilterExpr::parse_flat(&json!({"staining": "SC-001"})).unwrap();
        assert!(expr.matches(&he_record()));

        // Negation must be absent from values AND codes.
        let neg = FilterExpr::parse_flat(&json!({"staining": "!SC-001"})).unwrap();
        assert!(!neg.matches(&he_record()));
    }

    #[test]
    fn flat_rejects_unknown_facet_with_options() {
        let err = FilterExpr::parse_flat(&json!({"scanner": "X"})).unwrap_err();
        assert!(err.to_string().contains("staining"));
    }

    #[test]
    fn tree_parses_and_or_condition() {
        let doc = parse_document(
            r#"<filter>
                 <and>
                   <condition variable="staining" value="HE"/>
                   <or>
                     <condition variable="anatomical_site" value="skin"/>
                     <condition variable="anatomical_site" value="liver"/>
                   </or>
                 </and>
               </filter>"#,
        )
        .unwrap();
        let expr = FilterExpr::parse_tree(&doc).unwrap();
        assert!(expr.matches(&he_record()));
    }

    #[test]
    fn tree_and_flat_agree_on_equivalent_filters() {
        let record = he_record();

        let flat = FilterExpr::parse_flat(&json!({"staining": "HE|PAS"})).unwrap();
        let tree = FilterExpr::parse_tree(
            &parse_document(
                r#"<filter><or>
                     <condition variable="STAINING" value="HE"/>
                     <condition variable="STAINING" value="PAS"/>
                   </or></filter>"#,
            )
            .unwrap(),
        )
        .unwrap();

        assert_eq!(flat.matches(&record), tree.matches(&record));

        let flat_miss = FilterExpr::parse_flat(&json!({"species": "mus musculus"})).unwrap();
        let tree_miss = FilterExpr::parse_tree(
            &parse_document(r#"<filter><condition variable="SPECIES" value="mus musculus"/></filter>"#)
                .unwrap(),
        )
        .unwrap();
        assert_eq!(flat_miss.matches(&record), tree_miss.matches(&record));
        assert!(!flat_miss.matches(&record));
    }

    #[test]
    fn tree_rejects_empty_logical_nodes() {
        let doc = parse_document("<filter><and/></filter>").unwrap();
        let err = FilterExpr::parse_tree(&doc).unwrap_err();
        assert!(matches!(err, RetrievalError::UnknownFilterSyntax { .. }));
    }

    #[test]
    fn tree_rejects_unknown_variable_with_options() {
        let doc = parse_document(r#"<filter><condition variable="scanner" value="X"/></filter>"#)
            .unwrap();
        let err = FilterExpr::parse_tree(&doc).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("scanner") && msg.contains("ANATOMICAL_SITE"), "{msg}");
    }
}
