//! Per-node file helpers shared by families.
//!
//! Each helper targets either every node or only the newly-added ones, so the
//! add-node path of a family can reuse the exact steps of its build path.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;
use crate::models::Node;
use crate::orchestrator::{for_each_node, BuildContext, NodeSelection};

const HEREDOC_DELIMITER: &str = "LEDGERFORGE_EOF";

/// Shell command writing `contents` to `dest` inside a container.
pub fn write_file_command(dest: &str, contents: &str) -> String {
    let mut contents = contents.to_string();
    if !contents.ends_with('\n') {
        contents.push('\n');
    }
    format!(
        "cat > {} <<'{}'\n{}{}",
        dest, HEREDOC_DELIMITER, contents, HEREDOC_DELIMITER
    )
}

pub async fn mkdir_all_nodes(ctx: &BuildContext<'_>, dir: &str) -> Result<()> {
    mkdir(ctx, NodeSelection::All, dir).await
}

pub async fn mkdir_new_nodes(ctx: &BuildContext<'_>, dir: &str) -> Result<()> {
    mkdir(ctx, NodeSelection::NewlyAdded, dir).await
}

pub async fn copy_bytes_to_all_nodes(ctx: &BuildContext<'_>, data: &str, dest: &str) -> Result<()> {
    copy_bytes(ctx, NodeSelection::All, data, dest).await
}

pub async fn copy_bytes_to_new_nodes(ctx: &BuildContext<'_>, data: &str, dest: &str) -> Result<()> {
    copy_bytes(ctx, NodeSelection::NewlyAdded, data, dest).await
}

/// Render a config for every node with `render` and write it to `dest`.
pub async fn create_configs<F>(ctx: &BuildContext<'_>, dest: &str, render: F) -> Result<()>
where
    F: Fn(&Node) -> Result<Vec<u8>>,
{
    configs(ctx, NodeSelection::All, dest, render).await
}

/// Like `create_configs`, for the newly-added nodes only.
pub async fn create_configs_new_nodes<F>(ctx: &BuildContext<'_>, dest: &str, render: F) -> Result<()>
where
    F: Fn(&Node) -> Result<Vec<u8>>,
{
    configs(ctx, NodeSelection::NewlyAdded, dest, render).await
}

async fn mkdir(ctx: &BuildContext<'_>, selection: NodeSelection, dir: &str) -> Result<()> {
    let command = Arc::new(format!("mkdir -p {}", dir));
    for_each_node(ctx.network, selection, ctx.failure_policy, &ctx.cancel, move |host, node| {
        let command = Arc::clone(&command);
        async move {
            host.exec(&node, &command).await?;
            Ok(())
        }
    })
    .await
}

async fn copy_bytes(ctx: &BuildContext<'_>, selection: NodeSelection, data: &str, dest: &str) -> Result<()> {
    let command = Arc::new(write_file_command(dest, data));
    for_each_node(ctx.network, selection, ctx.failure_policy, &ctx.cancel, move |host, node| {
        let command = Arc::clone(&command);
        async move {
            host.exec(&node, &command).await?;
            Ok(())
        }
    })
    .await
}

async fn configs<F>(ctx: &BuildContext<'_>, selection: NodeSelection, dest: &str, render: F) -> Result<()>
where
    F: Fn(&Node) -> Result<Vec<u8>>,
{
    // Render up front so a template error fails before any node is touched.
    let mut commands = HashMap::new();
    for node in crate::orchestrator::select_nodes(ctx.network, selection) {
        let rendered = render(&node)?;
        commands.insert(
            node.absolute_index,
            write_file_command(dest, &String::from_utf8_lossy(&rendered)),
        );
    }
    let commands = Arc::new(commands);

    for_each_node(ctx.network, selection, ctx.failure_policy, &ctx.cancel, move |host, node| {
        let commands = Arc::clone(&commands);
        async move {
            if let Some(command) = commands.get(&node.absolute_index) {
                host.exec(&node, command).await?;
            }
            Ok(())
        }
    })
    .await
}
