use super::config::{load_config, load_credentials};
use crate::output::{new_table, Output};
use color_eyre::eyre::eyre;
use color_eyre::Result;
use comfy_table::{Attribute, Cell, Color};
use serde_json::json;
use watchsync_config::{PathManager, Role};
use watchsync_core::UserFilter;
use watchsync_models::{Section, ServerUser};
use watchsync_sources::create_server;

/// List the sections and users one server exposes, marking those the configured filter selects.
pub async fn run_users(role: Role, output: &Output) -> Result<()> {
    let paths = PathManager::default();
    let config = load_config(&paths)?;
    let credentials = load_credentials(&paths)?;
    let server = create_server(role, &config, &credentials)
        .map_err(|e| eyre!("Cannot set up the {} server: {}", role, e))?;

    let info = server
        .connect()
        .await
        .map_err(|e| eyre!("Cannot reach the {} server: {}", role, e))?;
    let sections = server.list_sections().await?;
    let users = server.list_users().await?;
    let filter = UserFilter::new(config.sync.users.iter());

    if !output.is_human() {
        let users: Vec<_> = users
            .iter()
            .map(|u| {
                json!({
                    "id": u.id,
                    "name": u.display_name(),
                    "owner": u.is_owner,
                    "selected": filter.matches(u),
                    "sections": u.section_ids,
                })
            })
            .collect();
        output.json(&json!({
            "type": "users",
            "server": info.name,
            "sections": sections,
            "users": users,
        }));
        return Ok(());
    }

    output.info(format!(
        "{} server: {} ({})",
        role,
        info.name,
        info.version.as_deref().unwrap_or("unknown version")
    ));
    output.table(&sections_table(&sections));
    output.table(&users_table(&users, &sections, &filter));
    for name in filter.unmatched(&users) {
        output.warn(format!("Configured user '{}' does not exist on the {} server", name, role));
    }
    Ok(())
}

fn sections_table(sections: &[Section]) -> comfy_table::Table {
    let mut table = new_table();
    table.set_header(vec![
        Cell::new("Section").add_attribute(Attribute::Bold),
        Cell::new("Title"),
        Cell::new("Kind"),
        Cell::new("Agent"),
    ]);
    for section in sections {
        table.add_row(vec![
            Cell::new(&section.id),
            Cell::new(&section.title),
            Cell::new(section.kind.to_string()),
            Cell::new(section.agent.as_deref().unwrap_or("-")),
        ]);
    }
    table
}

fn users_table(users: &[ServerUser], sections: &[Section], filter: &UserFilter) -> comfy_table::Table {
    let mut table = new_table();
    table.set_header(vec![
        Cell::new("User").add_attribute(Attribute::Bold),
        Cell::new("Id"),
        Cell::new("Sections"),
        Cell::new("Selected"),
    ]);
    for user in users {
        let mut name = user.display_name();
        if user.is_owner {
            name.push_str(" (owner)");
        }
        let visible = match &user.section_ids {
            None => "all".to_string(),
            Some(ids) => sections
                .iter()
                .filter(|s| ids.contains(&s.id))
                .map(|s| s.title.as_str())
                .collect::<Vec<_>>()
                .join(", "),
        };
        let selected = if filter.matches(user) {
            Cell::new("yes").fg(Color::Green)
        } else {
            Cell::new("no").fg(Color::DarkGrey)
        };
        table.add_row(vec![Cell::new(name), Cell::new(&user.id), Cell::new(visible), selected]);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use watchsync_models::MediaKind;

    #[test]
    fn test_users_table_lists_visible_sections() {
        let sections = vec![
            Section::new("1", "Movies", MediaKind::Movie),
            Section::new("2", "TV Shows", MediaKind::Episode),
        ];
        let users = vec![
            ServerUser::owner("1", "alice"),
            ServerUser::new("2", "bob").with_sections(["2"]),
        ];
        let filter = UserFilter::new(["Bob"]);
        let rendered = users_table(&users, &sections, &filter).to_string();
        assert!(rendered.contains("alice (owner)"));
        assert!(rendered.contains("TV Shows"));
        assert_eq!(rendered.matches("yes").count(), 1);
    }
}
