use strchat_core::UserAction;

/// Turn one input line into an action. `Ok(None)` for blank lines, `Err`
/// with a user-facing message for unknown commands.
pub fn parse_line(line: &str) -> Result<Option<UserAction>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(command_line) = line.strip_prefix('/') else {
        return Ok(Some(UserAction::SendMessage {
            text: line.to_string(),
        }));
    };

    let (command, rest) = match command_line.split_once(char::is_whitespace) {
        Some((command, rest)) => (command, rest.trim()),
        None => (command_line, ""),
    };
    let rest_owned = rest.to_string();

    let action = match command.to_ascii_lowercase().as_str() {
        "join" | "j" => UserAction::JoinChats { names: rest_owned },
        "set" | "s" => {
            let names: Vec<&str> = rest
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|n| !n.is_empty())
                .collect();
            match names.as_slice() {
                [] => UserAction::GetActiveChat,
                [single] => UserAction::ActivateView {
                    name: single.to_string(),
                },
                _ => UserAction::CreateGroup {
                    members: names.join(","),
                },
            }
        }
        "list" | "l" => UserAction::ListChats,
        "del" | "d" => UserAction::DeleteView { name: rest_owned },
        "nick" | "n" => UserAction::SetNick { nick: rest_owned },
        "pow" | "p" => UserAction::SetPow {
            difficulty: rest_owned,
        },
        "block" | "b" if rest.is_empty() => UserAction::ListBlocked,
        "block" | "b" => UserAction::BlockUser { target: rest_owned },
        "unblock" | "ub" => UserAction::UnblockUser { target: rest_owned },
        "filter" | "f" => UserAction::HandleFilter {
            pattern: rest_owned,
        },
        "unfilter" | "uf" if rest.is_empty() => UserAction::ClearFilters,
        "unfilter" | "uf" => UserAction::RemoveFilter { index: rest_owned },
        "mute" | "m" => UserAction::HandleMute {
            pattern: rest_owned,
        },
        "unmute" | "um" if rest.is_empty() => UserAction::ClearMutes,
        "unmute" | "um" => UserAction::RemoveMute { index: rest_owned },
        "relay" | "r" => UserAction::ManageAnchors { args: rest_owned },
        "complete" => UserAction::RequestNickCompletion { prefix: rest_owned },
        "help" | "h" => UserAction::GetHelp,
        "quit" | "q" => UserAction::Quit,
        other => {
            return Err(format!(
                "Unknown command: /{other}. Type /help for a list of commands."
            ));
        }
    };
    Ok(Some(action))
}
