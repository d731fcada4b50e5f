//! Task input composition.
//!
//! Every input is a pure function of the pipeline key and upstream outcomes.
//! Analysis contributions always appear in [`TaskKind::ANALYSIS`] order.

use std::collections::BTreeMap;

use aprlens_core::{analysis_placeholder, PipelineKey, StageOutcome, TaskKind};

/// Input for every analysis task.
pub fn analysis_input(key: &PipelineKey) -> String {
    format!("Please analyze APR {} as per your instructions.", key)
}

/// Input for the linking task.
pub fn linking_input(key: &PipelineKey, analysis: &BTreeMap<TaskKind, StageOutcome>) -> String {
    format!(
        "Please link the metric findings for APR {} to the tickets and pull requests \
         released with it.\n\n\
         Here are the metric analysis findings from the specialized agents:\n\n\
         {}\n\n\
         Please report the linkages following your instructions.",
        key,
        analysis_sections(analysis)
    )
}

/// Input for the synthesis task.
pub fn synthesis_input(
    key: &PipelineKey,
    analysis: &BTreeMap<TaskKind, StageOutcome>,
    linking: &StageOutcome,
) -> String {
    format!(
        "Please analyze and synthesize the results for APR {}.\n\n\
         Here are the metric analysis findings from the specialized agents:\n\n\
         {}\n\n\
         {} AGENT FINDINGS:\n{}\n\n\
         Please create your comprehensive analysis following your instructions.",
        key,
        analysis_sections(analysis),
        TaskKind::Linker.label(),
        linking.payload_or_substitute()
    )
}

fn analysis_sections(analysis: &BTreeMap<TaskKind, StageOutcome>) -> String {
    TaskKind::ANALYSIS
        .iter()
        .map(|kind| {
            let text = analysis
                .get(kind)
                .map(|outcome| outcome.payload_or_substitute().to_string())
                .unwrap_or_else(|| analysis_placeholder(*kind));
            format!("{} AGENT ANALYSIS:\n{}", kind.label(), text)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use aprlens_core::{RunFailure, RunStatus, NO_LINKAGES_SENTINEL};

    fn key() -> PipelineKey {
        PipelineKey::parse("APR-121").unwrap()
    }

    fn outcomes() -> BTreeMap<TaskKind, StageOutcome> {
        // Inserted out of order on purpose.
        let mut map = BTreeMap::new();
        map.insert(TaskKind::Dup, StageOutcome::completed("dup text"));
        map.insert(TaskKind::Pav, StageOutcome::completed("pav text"));
        map.insert(TaskKind::Sup, StageOutcome::completed("sup text"));
        map.insert(TaskKind::Ppa, StageOutcome::completed("ppa text"));
        map
    }

    #[test]
    fn test_analysis_input_uses_bare_key() {
        assert_eq!(
            analysis_input(&key()),
            "Please analyze APR 121 as per your instructions."
        );
    }

    #[test]
    fn test_linking_input_order() {
        let input = linking_input(&key(), &outcomes());
        let positions: Vec<usize> = ["PAV AGENT ANALYSIS:\npav text", "PPA AGENT", "SUP AGENT", "DUP AGENT"]
            .iter()
            .map(|needle| input.find(needle).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
        assert!(input.contains("APR 121"));
    }

    #[test]
    fn test_synthesis_input_contains_sentinel() {
        let linking = StageOutcome::linking_degraded(RunFailure {
            kind: RunStatus::TimedOut,
            message: "slow".to_string(),
            attempts: 3,
        });
        let input = synthesis_input(&key(), &outcomes(), &linking);
        assert!(input.contains(&format!("LINKER AGENT FINDINGS:\n{}", NO_LINKAGES_SENTINEL)));
        assert!(input.find("DUP AGENT").unwrap() < input.find("LINKER AGENT").unwrap());
    }

    #[test]
    fn test_missing_kind_gets_placeholder() {
        let mut map = outcomes();
        map.remove(&TaskKind::Sup);
        let input = linking_input(&key(), &map);
        assert!(input.contains(&analysis_placeholder(TaskKind::Sup)));
    }
}
