use crate::annotate::{AddressTag, Position};
use crate::tracer::{FlowNode, FlowTree, PrunedSummary, share_percent};
use alloy_primitives::{Address, U256, utils::format_units};
use comfy_table::{Cell, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL};
use csv::Writer;
use serde_json::json;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub enum OutputFormat {
    Table,
    Json,
    Csv,
}

impl OutputFormat {
    /// Decorative separators and headers are table-only; json and csv output
    /// must stay machine-parseable.
    pub fn is_table(&self) -> bool {
        matches!(self, OutputFormat::Table)
    }
}

impl From<&str> for OutputFormat {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => OutputFormat::Json,
            "csv" => OutputFormat::Csv,
            _ => OutputFormat::Table,
        }
    }
}

pub fn format_amount(value: U256, decimals: u8) -> String {
    fmt_amount(value, decimals)
}

fn fmt_amount(value: U256, decimals: u8) -> String {
    let formatted = format_units(value, decimals).unwrap_or_else(|_| value.to_string());
    // zero-decimal tokens format as "1000."
    formatted.trim_end_matches('.').to_string()
}

pub fn format_holders(
    holders: &[(Address, U256)],
    decimals: u8,
    symbol: &str,
    format: &OutputFormat,
) -> String {
    match format {
        OutputFormat::Table => format_holders_table(holders, decimals, symbol),
        OutputFormat::Json => format_holders_json(holders, decimals),
        OutputFormat::Csv => format_holders_csv(holders, decimals),
    }
}

fn format_holders_table(holders: &[(Address, U256)], decimals: u8, symbol: &str) -> String {
    if holders.is_empty() {
        return "No holders found.".to_string();
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            "Rank".to_string(),
            "Address".to_string(),
            format!("Balance ({symbol})"),
            "Balance (Wei)".to_string(),
        ]);

    for (i, (address, balance)) in holders.iter().enumerate() {
        table.add_row(vec![
            Cell::new(i + 1),
            Cell::new(format!("{address:#}")),
            Cell::new(fmt_amount(*balance, decimals)),
            Cell::new(balance.to_string()),
        ]);
    }

    table.to_string()
}

fn format_holders_json(holders: &[(Address, U256)], decimals: u8) -> String {
    let json_holders: Vec<_> = holders
        .iter()
        .enumerate()
        .map(|(i, (address, balance))| {
            json!({
                "rank": i + 1,
                "address": address,
                "balance": fmt_amount(*balance, decimals),
                "balance_wei": balance.to_string(),
            })
        })
        .collect();

    serde_json::to_string_pretty(&json_holders).unwrap_or_else(|_| "[]".to_string())
}

fn format_holders_csv(holders: &[(Address, U256)], decimals: u8) -> String {
    let mut wtr = Writer::from_writer(vec![]);

    let _ = wtr.write_record(["rank", "address", "balance", "balance_wei"]);

    for (i, (address, balance)) in holders.iter().enumerate() {
        let _ = wtr.write_record([
            &(i + 1).to_string(),
            &format!("{address:?}"),
            &fmt_amount(*balance, decimals),
            &balance.to_string(),
        ]);
    }

    String::from_utf8(wtr.into_inner().unwrap_or_default()).unwrap_or_default()
}

/// Positions shown in a tag, optionally narrowed to the traced asset.
fn visible_positions<'a>(positions: &'a [Position], mask_asset: Option<&str>) -> Vec<&'a Position> {
    positions
        .iter()
        .filter(|p| mask_asset.is_none_or(|symbol| p.symbol.eq_ignore_ascii_case(symbol)))
        .collect()
}

/// Compact bracketed tag after an address, e.g.
/// `[aUSDC (AaveV3Ethereum)]` or `[supplying: WETH 12 | borrowing: USDC 300]`.
pub fn format_tag(tag: &AddressTag, mask_asset: Option<&str>) -> String {
    if let Some(label) = &tag.receipt_token {
        return format!("  [{label}]");
    }

    let fmt_positions = |positions: Vec<&Position>| {
        positions
            .iter()
            .map(|p| {
                let units = fmt_amount(p.balance, p.decimals);
                let whole = units.split('.').next().unwrap_or(&units).to_string();
                format!("{} {}", p.symbol, whole)
            })
            .collect::<Vec<_>>()
            .join(", ")
    };

    let supplying = visible_positions(&tag.supplying, mask_asset);
    let borrowing = visible_positions(&tag.borrowing, mask_asset);

    let mut parts = Vec::new();
    if !supplying.is_empty() {
        parts.push(format!("supplying: {}", fmt_positions(supplying)));
    }
    if !borrowing.is_empty() {
        parts.push(format!("borrowing: {}", fmt_positions(borrowing)));
    }

    if parts.is_empty() {
        return match tag.is_contract {
            Some(true) => "  [contract]".to_string(),
            _ => String::new(),
        };
    }
    format!("  [{}]", parts.join(" | "))
}

pub fn format_flow_tree(
    tree: &FlowTree,
    decimals: u8,
    symbol: &str,
    tags: &HashMap<Address, AddressTag>,
    mask_asset: Option<&str>,
    format: &OutputFormat,
) -> String {
    match format {
        OutputFormat::Table => format_flow_tree_text(tree, decimals, symbol, tags, mask_asset),
        OutputFormat::Json => {
            serde_json::to_string_pretty(tree).unwrap_or_else(|_| "{}".to_string())
        }
        OutputFormat::Csv => format_flow_tree_csv(tree, decimals),
    }
}

fn fmt_flow_line(
    address: Address,
    amount: U256,
    root_total: U256,
    decimals: u8,
    symbol: &str,
    tags: &HashMap<Address, AddressTag>,
    mask_asset: Option<&str>,
) -> String {
    let tag = tags
        .get(&address)
        .map(|t| format_tag(t, mask_asset))
        .unwrap_or_default();
    format!(
        "{address:#}  {} {symbol} ({:.1}% of total){tag}",
        fmt_amount(amount, decimals),
        share_percent(amount, root_total),
    )
}

fn fmt_pruned_line(pruned: &PrunedSummary, decimals: u8, symbol: &str) -> String {
    let noun = if pruned.count == 1 {
        "recipient"
    } else {
        "recipients"
    };
    format!(
        "({} {noun} below threshold, {} {symbol} total)",
        pruned.count,
        fmt_amount(pruned.amount, decimals),
    )
}

fn format_flow_tree_text(
    tree: &FlowTree,
    decimals: u8,
    symbol: &str,
    tags: &HashMap<Address, AddressTag>,
    mask_asset: Option<&str>,
) -> String {
    if tree.total.is_zero() {
        return format!("No outgoing transfers found for {:#}.", tree.root);
    }

    let mut out = String::new();
    out.push_str(&format!(
        "{:#}  sent {} {symbol} total\n",
        tree.root,
        fmt_amount(tree.total, decimals)
    ));

    let mut lines: Vec<(usize, String)> = Vec::new();
    for branch in &tree.branches {
        lines.push((
            1,
            fmt_flow_line(
                branch.address,
                branch.amount,
                tree.total,
                decimals,
                symbol,
                tags,
                mask_asset,
            ),
        ));
        for child in &branch.children {
            lines.push((
                2,
                fmt_flow_line(
                    child.address,
                    child.amount,
                    tree.total,
                    decimals,
                    symbol,
                    tags,
                    mask_asset,
                ),
            ));
        }
        if let Some(pruned) = &branch.pruned {
            lines.push((2, fmt_pruned_line(pruned, decimals, symbol)));
        }
    }
    if let Some(pruned) = &tree.pruned {
        lines.push((1, fmt_pruned_line(pruned, decimals, symbol)));
    }

    for (depth, line) in lines {
        out.push_str(&"    ".repeat(depth));
        out.push_str("└─ ");
        out.push_str(&line);
        out.push('\n');
    }
    out
}

fn format_flow_tree_csv(tree: &FlowTree, decimals: u8) -> String {
    let mut wtr = Writer::from_writer(vec![]);

    let _ = wtr.write_record(["level", "parent", "address", "amount", "amount_wei", "share_pct"]);

    let mut row = |level: usize, parent: Address, address: String, amount: U256| {
        let _ = wtr.write_record([
            &level.to_string(),
            &format!("{parent:?}"),
            &address,
            &fmt_amount(amount, decimals),
            &amount.to_string(),
            &format!("{:.2}", share_percent(amount, tree.total)),
        ]);
    };
    let pruned_label =
        |pruned: &PrunedSummary| format!("(pruned: {} recipients)", pruned.count);

    // pruned aggregates get a row too, so each level's amounts sum back to
    // the parent's total
    for branch in &tree.branches {
        row(1, tree.root, format!("{:?}", branch.address), branch.amount);
        for child in &branch.children {
            row(2, branch.address, format!("{:?}", child.address), child.amount);
        }
        if let Some(pruned) = &branch.pruned {
            row(2, branch.address, pruned_label(pruned), pruned.amount);
        }
    }
    if let Some(pruned) = &tree.pruned {
        row(1, tree.root, pruned_label(pruned), pruned.amount);
    }

    String::from_utf8(wtr.into_inner().unwrap_or_default()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> Address {
        Address::repeat_byte(n)
    }

    fn sample_tree() -> FlowTree {
        FlowTree {
            root: addr(1),
            total: U256::from(1_000u64),
            branches: vec![FlowNode {
                address: addr(2),
                amount: U256::from(950),
                outflow_total: Some(U256::from(100)),
                children: vec![FlowNode {
                    address: addr(3),
                    amount: U256::from(100),
                    outflow_total: None,
                    children: vec![],
                    pruned: None,
                }],
                pruned: None,
            }],
            pruned: Some(PrunedSummary {
                count: 2,
                amount: U256::from(50),
            }),
        }
    }

    #[test]
    fn text_tree_mentions_total_and_pruned() {
        let rendered =
            format_flow_tree_text(&sample_tree(), 0, "USDC", &HashMap::new(), None);
        assert!(rendered.contains("sent 1000 USDC total"));
        assert!(rendered.contains("95.0% of total"));
        assert!(rendered.contains("2 recipients below threshold"));
    }

    #[test]
    fn csv_tree_has_one_row_per_node_and_pruned_aggregate() {
        let rendered = format_flow_tree_csv(&sample_tree(), 0);
        // header + level-1 node + level-2 node + level-1 pruned row
        assert_eq!(rendered.trim_end().lines().count(), 4);
        assert!(rendered.contains("(pruned: 2 recipients)"));
    }

    #[test]
    fn csv_level_one_amounts_reconcile_to_total() {
        let rendered = format_flow_tree_csv(&sample_tree(), 0);
        let level1_wei: u64 = rendered
            .trim_end()
            .lines()
            .skip(1)
            .filter(|line| line.starts_with("1,"))
            .map(|line| line.split(',').nth(4).unwrap().parse::<u64>().unwrap())
            .sum();
        assert_eq!(level1_wei, 1_000);
    }

    #[test]
    fn receipt_token_tag_short_circuits() {
        let tag = AddressTag {
            receipt_token: Some("aUSDC (AaveV3Ethereum)".to_string()),
            is_contract: Some(true),
            ..AddressTag::default()
        };
        assert_eq!(format_tag(&tag, None), "  [aUSDC (AaveV3Ethereum)]");
    }

    #[test]
    fn mask_hides_unrelated_positions() {
        let tag = AddressTag {
            receipt_token: None,
            is_contract: Some(true),
            supplying: vec![Position {
                symbol: "WETH".to_string(),
                balance: U256::from(5),
                decimals: 0,
            }],
            borrowing: vec![Position {
                symbol: "USDC".to_string(),
                balance: U256::from(300),
                decimals: 0,
            }],
        };

        let full = format_tag(&tag, None);
        assert!(full.contains("WETH") && full.contains("USDC"));

        let masked = format_tag(&tag, Some("USDC"));
        assert!(!masked.contains("WETH"));
        assert!(masked.contains("borrowing: USDC 300"));
    }

    #[test]
    fn only_table_output_is_decorated() {
        assert!(OutputFormat::from("table").is_table());
        assert!(OutputFormat::from("anything-else").is_table());
        assert!(!OutputFormat::from("json").is_table());
        assert!(!OutputFormat::from("csv").is_table());
    }

    #[test]
    fn contract_fallback_tag() {
        let tag = AddressTag {
            is_contract: Some(true),
            ..AddressTag::default()
        };
        assert_eq!(format_tag(&tag, None), "  [contract]");
        assert_eq!(format_tag(&AddressTag::default(), None), "");
    }
}
