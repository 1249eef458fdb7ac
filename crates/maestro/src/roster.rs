use serde::{Deserialize, Serialize};
use ts_rs::TS;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum Division {
    Product,
    Engineering,
    Design,
    Testing,
    Documentation,
}

impl std::fmt::Display for Division {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Division::Product => "product",
            Division::Engineering => "engineering",
            Division::Design => "design",
            Division::Testing => "testing",
            Division::Documentation => "documentation",
        };
        write!(f, "{}", s)
    }
}

/// A named specialist the engine can invoke. The `system_prompt` is the
/// persona handed to the generation backend; everything else is display
/// and routing metadata.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct AgentSpec {
    pub name: String,
    pub display_name: String,
    pub designation: String,
    pub division: Division,
    pub capabilities: Vec<String>,
    #[serde(skip)]
    #[ts(skip)]
    pub system_prompt: String,
}

impl AgentSpec {
    fn new(
        name: &str,
        display_name: &str,
        designation: &str,
        division: Division,
        capabilities: &[&str],
        system_prompt: &str,
    ) -> Self {
        Self {
            name: name.to_string(),
            display_name: display_name.to_string(),
            designation: designation.to_string(),
            division,
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            system_prompt: system_prompt.to_string(),
        }
    }
}

/// Fixed lookup table of the built-in agents. Runs reference agents by
/// `name`; an unknown name is a permanent invocation failure, so the
/// planner is always validated against this roster.
#[derive(Debug, Clone)]
pub struct AgentRoster {
    agents: Vec<AgentSpec>,
}

impl AgentRoster {
    pub fn builtin() -> Self {
        Self {
            agents: vec![
                AgentSpec::new(
                    "scribe",
                    "Scribe",
                    "Requirements Author",
                    Division::Product,
                    &["requirements", "acceptance-criteria", "scoping"],
                    "You are Scribe, a requirements author. You turn a short project \
                     description into a precise, testable requirements brief. You write \
                     in markdown, you number every requirement, and you never invent \
                     scope the description does not imply.",
                ),
                AgentSpec::new(
                    "slate",
                    "Slate",
                    "Delivery Planner",
                    Division::Product,
                    &["decomposition", "estimation", "sequencing"],
                    "You are Slate, a delivery planner. You break a requirements brief \
                     into small, independently deliverable work items and assign each to \
                     the best-suited agent. When asked for JSON you reply with JSON only, \
                     no prose around it.",
                ),
                AgentSpec::new(
                    "mason",
                    "Mason",
                    "Build Engineer",
                    Division::Engineering,
                    &["implementation", "apis", "data-modeling"],
                    "You are Mason, a build engineer. Given a work item and its \
                     requirements you produce the deliverable itself, complete and \
                     self-contained. When verification feedback is provided you address \
                     every point of it in the next version.",
                ),
                AgentSpec::new(
                    "probe",
                    "Probe",
                    "Verification Analyst",
                    Division::Testing,
                    &["verification", "edge-cases", "acceptance-testing"],
                    "You are Probe, a verification analyst. You judge a deliverable \
                     strictly against its requirements and report a verdict. When asked \
                     for JSON you reply with JSON only. Your feedback is concrete enough \
                     that the author can act on it without asking questions.",
                ),
                AgentSpec::new(
                    "vista",
                    "Vista",
                    "Systems Illustrator",
                    Division::Design,
                    &["architecture-diagrams", "mermaid", "system-overviews"],
                    "You are Vista, a systems illustrator. You draw component and flow \
                     diagrams in mermaid, with a short legend. Every box in your diagram \
                     corresponds to something that actually exists in the delivered work.",
                ),
                AgentSpec::new(
                    "docent",
                    "Docent",
                    "Manual Writer",
                    Division::Documentation,
                    &["user-manuals", "tutorials", "troubleshooting"],
                    "You are Docent, a manual writer. You write end-user documentation \
                     for the delivered system: setup, everyday usage, troubleshooting. \
                     You document what was built, not what was planned.",
                ),
                AgentSpec::new(
                    "tally",
                    "Tally",
                    "Quality Reporter",
                    Division::Testing,
                    &["reporting", "quality-summaries", "risk-callouts"],
                    "You are Tally, a quality reporter. You summarize verification \
                     outcomes per deliverable into a report: what passed, what failed, \
                     how many rounds each item took, and the open risks.",
                ),
            ],
        }
    }

    pub fn get(&self, name: &str) -> Option<&AgentSpec> {
        self.agents.iter().find(|a| a.name == name)
    }

    pub fn all(&self) -> &[AgentSpec] {
        &self.agents
    }

    pub fn names(&self) -> Vec<&str> {
        self.agents.iter().map(|a| a.name.as_str()).collect()
    }

    pub fn by_division(&self, division: Division) -> Vec<&AgentSpec> {
        self.agents
            .iter()
            .filter(|a| a.division == division)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_names_are_unique() {
        let roster = AgentRoster::builtin();
        let mut names = roster.names();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), roster.all().len());
    }

    #[test]
    fn lookup_is_exact() {
        let roster = AgentRoster::builtin();
        assert!(roster.get("mason").is_some());
        assert!(roster.get("Mason").is_none());
        assert!(roster.get("unknown-agent").is_none());
    }

    #[test]
    fn every_agent_has_a_persona() {
        let roster = AgentRoster::builtin();
        assert!(roster.all().iter().all(|a| !a.system_prompt.is_empty()));
        assert!(roster.all().iter().all(|a| !a.capabilities.is_empty()));
    }

    #[test]
    fn divisions_partition_the_roster() {
        let roster = AgentRoster::builtin();
        assert_eq!(roster.by_division(Division::Testing).len(), 2);
        assert_eq!(roster.by_division(Division::Engineering).len(), 1);
    }
}
