//! Topological ordering of sources by their requirements.

use std::collections::HashMap;

use thiserror::Error;

#[derive(Debug, Error)]
#[error("cycle found on source {0:?}")]
pub struct CycleError(pub String);

#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Grey,
    Black,
}

/// Order `nodes` so that every source appears after the sources it requires.
///
/// Requirements naming unknown sources are skipped here; the builder reports
/// them when it actually needs the files. Cycles are rejected with the name
/// of the first source seen twice on the active path.
pub fn sort_sources(nodes: &[(String, Vec<String>)]) -> Result<Vec<String>, CycleError> {
    let index: HashMap<&str, &[String]> = nodes
        .iter()
        .map(|(name, reqs)| (name.as_str(), reqs.as_slice()))
        .collect();
    let mut colors: HashMap<&str, Color> = nodes
        .iter()
        .map(|(name, _)| (name.as_str(), Color::White))
        .collect();
    let mut order = Vec::with_capacity(nodes.len());

    fn visit<'a>(
        name: &'a str,
        index: &HashMap<&'a str, &'a [String]>,
        colors: &mut HashMap<&'a str, Color>,
        order: &mut Vec<String>,
    ) -> Result<(), CycleError> {
        match colors.get(name).copied() {
            None => return Ok(()), // requirement on a source we do not know
            Some(Color::Black) => return Ok(()),
            Some(Color::Grey) => return Err(CycleError(name.to_string())),
            Some(Color::White) => {}
        }
        colors.insert(name, Color::Grey);
        for req in index.get(name).copied().unwrap_or_default() {
            visit(req, index, colors, order)?;
        }
        colors.insert(name, Color::Black);
        order.push(name.to_string());
        Ok(())
    }

    for (name, _) in nodes {
        visit(name, &index, &mut colors, &mut order)?;
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, reqs: &[&str]) -> (String, Vec<String>) {
        (
            name.to_string(),
            reqs.iter().map(|r| (*r).to_string()).collect(),
        )
    }

    #[test]
    fn test_requirements_come_first() {
        let nodes = vec![
            node("A", &["B"]),
            node("B", &["C", "D"]),
            node("C", &["missing"]),
            node("D", &["C"]),
        ];
        let order = sort_sources(&nodes).unwrap();
        assert_eq!(order, vec!["C", "D", "B", "A"]);
    }

    #[test]
    fn test_cycle_is_rejected() {
        let nodes = vec![node("A", &["B"]), node("B", &["E"]), node("E", &["A"])];
        let err = sort_sources(&nodes).unwrap_err();
        assert_eq!(err.to_string(), "cycle found on source \"A\"");
    }

    #[test]
    fn test_independent_sources_keep_input_order() {
        let nodes = vec![node("b", &[]), node("a", &[])];
        assert_eq!(sort_sources(&nodes).unwrap(), vec!["b", "a"]);
    }
}
