//! Topology summary table printed after a run.

use colored::Colorize;
use tabled::settings::Style;
use tabled::{Table, Tabled};

use nodeup::upgrade::{ClusterTopology, DiscoveredNode, NodeState};

/// Row for the node table.
#[derive(Tabled)]
struct NodeRow {
    #[tabled(rename = "NODE")]
    node: String,
    #[tabled(rename = "POOL")]
    pool: String,
    #[tabled(rename = "SLOT")]
    slot: usize,
    #[tabled(rename = "VERSION")]
    version: String,
    #[tabled(rename = "SOURCE")]
    source: String,
    #[tabled(rename = "STATE")]
    state: String,
    #[tabled(rename = "ERROR")]
    error: String,
}

fn colored_state(state: NodeState) -> String {
    match state {
        NodeState::Upgraded => state.as_str().green().to_string(),
        NodeState::Failed => state.as_str().red().to_string(),
        NodeState::Pending => state.as_str().to_string(),
        _ => state.as_str().yellow().to_string(),
    }
}

fn node_row(node: &DiscoveredNode) -> NodeRow {
    NodeRow {
        node: node.name.clone(),
        pool: node.pool.to_string(),
        slot: node.slot,
        version: node
            .version
            .as_deref()
            .map(|v| v.split_once(':').map_or(v, |(_, version)| version))
            .unwrap_or("-")
            .to_string(),
        source: node.classified_by.to_string(),
        state: colored_state(node.state),
        error: node.failure.clone().unwrap_or_else(|| "-".to_string()),
    }
}

/// Print every discovered node with its final state, then the VMs that
/// could not be tied to the cluster.
pub fn print_topology(topology: &ClusterTopology, resource_group: &str) {
    let rows: Vec<NodeRow> = topology.nodes().map(node_row).collect();
    if rows.is_empty() {
        println!("No cluster VMs found in {resource_group}.");
        return;
    }

    println!();
    println!(
        "{} (resource group: {}, {}/{} upgraded):",
        "Nodes".bold(),
        resource_group,
        topology.upgraded_count(),
        topology.node_count()
    );

    let mut table = Table::new(&rows);
    apply_table_style(&mut table);
    println!("{table}");

    if !topology.unclassified.is_empty() {
        println!();
        println!(
            "{} {} VM(s) skipped, not part of this cluster:",
            "⚠".yellow(),
            topology.unclassified.len()
        );
        for vm in &topology.unclassified {
            println!("  {}", vm.name.dimmed());
        }
    }
}

fn apply_table_style(table: &mut Table) {
    use tabled::settings::object::Columns;
    use tabled::settings::themes::Theme;
    use tabled::settings::{Modify, Padding};

    let mut theme = Theme::from_style(Style::empty());
    theme.remove_horizontal_lines();
    table.with(theme);
    table.with(Modify::new(Columns::new(..)).with(Padding::new(0, 2, 0, 0)));
}
