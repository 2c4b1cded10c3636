use std::io::Write;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

use crate::controller::ChatController;
use crate::settings::RequestOverrides;

#[derive(Debug, PartialEq, Eq)]
pub enum ReplCommand<'a> {
    NewChat,
    Threads,
    Open(&'a str),
    Delete(&'a str),
    Tools,
    Quit,
    Submit(&'a str),
    Empty,
    Unknown(&'a str),
}

pub fn parse_command(line: &str) -> ReplCommand<'_> {
    let line = line.trim();
    if line.is_empty() {
        return ReplCommand::Empty;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return ReplCommand::Submit(line);
    };
    let (cmd, arg) = match rest.split_once(char::is_whitespace) {
        Some((c, a)) => (c, a.trim()),
        None => (rest, ""),
    };
    match (cmd, arg) {
        ("new", _) => ReplCommand::NewChat,
        ("threads", _) => ReplCommand::Threads,
        ("tools", _) => ReplCommand::Tools,
        ("quit" | "exit", _) => ReplCommand::Quit,
        ("open", id) if !id.is_empty() => ReplCommand::Open(id),
        ("delete", id) if !id.is_empty() => ReplCommand::Delete(id),
        _ => ReplCommand::Unknown(line),
    }
}

fn write_fragment<W: Write>(out: &mut W, fragment: &str) -> std::io::Result<()> {
    out.write_all(fragment.as_bytes())?;
    out.flush()
}

pub async fn run(controller: &mut ChatController, overrides: RequestOverrides) -> anyhow::Result<()> {
    println!("threadchat on thread {}. /new /threads /open <id> /delete <id> /tools /quit\n", controller.current_thread());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else { break };
        match parse_command(&line) {
            ReplCommand::Empty => continue,
            ReplCommand::Quit => break,
            ReplCommand::NewChat => println!("started {}", controller.new_chat()),
            ReplCommand::Threads => {
                for t in controller.sidebar().await {
                    let mark = if t.current { "*" } else { " " };
                    println!("{mark} {}  {}", t.id, t.name);
                }
            }
            ReplCommand::Open(id) => {
                for m in controller.select_thread(id).await {
                    println!("[{}] {}", m.role.as_str(), m.content);
                }
            }
            ReplCommand::Delete(id) => {
                if controller.delete_thread(id).await {
                    println!("deleted {id}; current thread is {}", controller.current_thread());
                } else {
                    eprintln!("could not delete {id}");
                }
            }
            ReplCommand::Tools => println!("{}", controller.tool_names().join(", ")),
            ReplCommand::Unknown(cmd) => eprintln!("unknown command: {cmd}"),
            ReplCommand::Submit(text) => {
                let res = controller
                    .submit_and_wait(text, overrides.clone(), |fragment| {
                        if let Err(e) = write_fragment(&mut std::io::stdout(), fragment) {
                            warn!(error = %e, "could not write to stdout");
                        }
                    })
                    .await;
                match res {
                    Ok(_) => println!("\n"),
                    Err(e) => eprintln!("\nError: {e}"),
                }
            }
        }
    }
    Ok(())
}
