//! Admin command dispatch and the privilege table.
//!
//! Commands arrive as `.command args...` in text messages sent privately
//! to the bot. Built-ins are checked against the sender's privilege;
//! anything else whose first token names a loaded plugin is forwarded to
//! that plugin as a CommandMessage.

use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Mutex;

use log::{error, info, warn};
use mumble::User;

use crate::plugin::{PluginEvent, PluginHost};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub enum Privilege {
    Normal,
    Authenticated,
    Admin,
}

impl fmt::Display for Privilege {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Privilege::Normal => "Normal",
            Privilege::Authenticated => "Authenticated",
            Privilege::Admin => "Admin",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for Privilege {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Privilege.Normal" | "Normal" => Ok(Privilege::Normal),
            "Privilege.Authenticated" | "Authenticated" => Ok(Privilege::Authenticated),
            "Privilege.Admin" | "Admin" => Ok(Privilege::Admin),
            _ => Err(()),
        }
    }
}

/// Privilege list plus the built-in command table.
pub struct Controller {
    path: PathBuf,
    privileges: Mutex<Vec<(String, Privilege)>>,
}

impl Controller {
    /// Loads the privilege file; a missing file just means an empty list.
    pub fn load(path: impl Into<PathBuf>) -> Controller {
        let path = path.into();
        let privileges = match fs::read_to_string(&path) {
            Ok(content) => parse_privileges(&content),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                warn!("failed to load privileges from {}: {}", path.display(), e);
                Vec::new()
            }
        };

        for (name, level) in &privileges {
            info!("adding {} {}", level, name);
        }

        Controller {
            path,
            privileges: Mutex::new(privileges),
        }
    }

    /// Rewrites the privilege file; written to a temporary and renamed so
    /// a crash cannot leave a half-written table.
    pub fn save(&self) -> io::Result<()> {
        let privileges = self.privileges.lock().unwrap();
        if privileges.is_empty() {
            return Ok(());
        }

        info!("saving privileges to {}...", self.path.display());

        let mut out = String::new();
        for (name, level) in privileges.iter() {
            out.push_str(&format!("{} = Privilege.{}\n", name, level));
        }

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, out)?;
        fs::rename(&tmp, &self.path)
    }

    fn reload(&self) {
        info!("loading privileges...");
        let loaded = match fs::read_to_string(&self.path) {
            Ok(content) => parse_privileges(&content),
            Err(e) => {
                warn!("failed to load privileges from {}: {}", self.path.display(), e);
                return;
            }
        };
        *self.privileges.lock().unwrap() = loaded;
    }

    /// A user's effective privilege: the explicit list entry, else
    /// Authenticated/Normal from the server-side flag.
    pub fn privilege_of(&self, user: &User) -> Privilege {
        let privileges = self.privileges.lock().unwrap();
        privileges
            .iter()
            .find(|(name, _)| *name == user.name)
            .map(|(_, level)| *level)
            .unwrap_or(if user.authenticated {
                Privilege::Authenticated
            } else {
                Privilege::Normal
            })
    }

    /// Normal always passes; Authenticated needs the server-side flag;
    /// Admin needs the flag plus an explicit entry at Admin or higher.
    pub fn check(&self, user: &User, level: Privilege) -> bool {
        match level {
            Privilege::Normal => true,
            Privilege::Authenticated => user.authenticated,
            Privilege::Admin => {
                if !user.authenticated {
                    return false;
                }
                let privileges = self.privileges.lock().unwrap();
                privileges
                    .iter()
                    .find(|(name, _)| *name == user.name)
                    .map(|(_, l)| *l >= level)
                    .unwrap_or(false)
            }
        }
    }

    /// Handles one `.command args...` line (without the leading dot).
    /// Replies to the sender go through `reply`.
    pub fn process_command(
        &self,
        reply: impl Fn(String),
        host: &PluginHost,
        user: &User,
        line: &str,
    ) {
        let mut parts = line.splitn(2, ' ');
        let name = match parts.next().filter(|n| !n.is_empty()) {
            Some(name) => name,
            None => return,
        };
        let rest = parts.next().unwrap_or("").trim();

        match name {
            "load" => {
                if !self.check(user, Privilege::Admin) {
                    reply(format!(
                        "privilege violation: command '{}' requires at least privilege Admin",
                        name
                    ));
                    return;
                }
                self.command_load(reply, host, rest);
            }
            _ if host.has_plugin(name) => {
                if rest.is_empty() {
                    reply(format!(
                        "please specify a valid command like this: '.{} command'",
                        name
                    ));
                    return;
                }
                host.queue(
                    name,
                    PluginEvent::CommandMessage {
                        session: user.session,
                        name: user.name.clone(),
                        command: rest.to_string(),
                    },
                );
            }
            _ => {
                reply(format!("unknown command '{}'", name));
            }
        }
    }

    fn command_load(&self, reply: impl Fn(String), host: &PluginHost, args: &str) {
        let mut parts = args.splitn(2, ' ');

        match parts.next() {
            Some("plugin") => match parts.next().map(str::trim).filter(|p| !p.is_empty()) {
                Some(plugin) => match host.reload(plugin) {
                    Ok(()) => {
                        reply(format!("plugin {} loaded successfully", plugin));
                    }
                    Err(e) => {
                        error!("{}", e);
                        reply(format!("failed to load plugin {}", plugin));
                    }
                },
                None => {
                    reply("please specify the plugin to load: load plugin 'plugin'".to_string());
                }
            },
            Some("privileges") => {
                self.reload();
                reply("privileges loaded".to_string());
            }
            _ => {
                reply("please specify what to load: load [plugin|privileges]".to_string());
            }
        }
    }
}

fn parse_privileges(content: &str) -> Vec<(String, Privilege)> {
    let mut out = Vec::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut parts = line.splitn(2, '=');
        let name = parts.next().map(str::trim).unwrap_or("");
        let level = parts.next().map(str::trim).and_then(|l| l.parse().ok());

        match (name.is_empty(), level) {
            (false, Some(level)) => out.push((name.to_string(), level)),
            _ => warn!("ignoring malformed privilege line: {}", line),
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(name: &str, authenticated: bool) -> User {
        User {
            session: 9,
            name: name.to_string(),
            user_id: authenticated.then(|| 1),
            authenticated,
            mute: false,
            deaf: false,
            suppressed: false,
            recording: false,
            channel: 0,
            address: None,
        }
    }

    #[test]
    fn parses_privilege_lines() {
        let parsed = parse_privileges(
            "alice = Privilege.Admin\n\
             bob=Privilege.Authenticated\n\
             # comment\n\
             broken line\n\
             carol = Privilege.Normal\n",
        );

        assert_eq!(
            parsed,
            vec![
                ("alice".to_string(), Privilege::Admin),
                ("bob".to_string(), Privilege::Authenticated),
                ("carol".to_string(), Privilege::Normal),
            ]
        );
    }

    #[test]
    fn save_and_reload_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("privileges.txt");

        fs::write(&path, "alice = Privilege.Admin\n").unwrap();

        let controller = Controller::load(&path);
        assert!(controller.check(&user("alice", true), Privilege::Admin));

        controller.save().unwrap();
        let controller = Controller::load(&path);
        assert!(controller.check(&user("alice", true), Privilege::Admin));
    }

    #[test]
    fn privilege_checks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("privileges.txt");
        fs::write(&path, "admin = Privilege.Admin\n").unwrap();
        let controller = Controller::load(&path);

        // Normal always passes
        assert!(controller.check(&user("anyone", false), Privilege::Normal));

        // Authenticated requires the server-side flag
        assert!(!controller.check(&user("anyone", false), Privilege::Authenticated));
        assert!(controller.check(&user("anyone", true), Privilege::Authenticated));

        // Admin requires authentication and a listed entry
        assert!(!controller.check(&user("admin", false), Privilege::Admin));
        assert!(controller.check(&user("admin", true), Privilege::Admin));
        assert!(!controller.check(&user("anyone", true), Privilege::Admin));
    }

    #[test]
    fn command_falls_through_to_plugin() {
        use crate::plugin::testing::RecordingPlugin;
        use crate::plugin::NullLoader;

        let dir = tempfile::tempdir().unwrap();
        let controller = Controller::load(dir.path().join("none.txt"));

        let (tx, rx) = std::sync::mpsc::channel();
        let host = PluginHost::new(Box::new(NullLoader));
        host.register(Box::new(RecordingPlugin {
            name: "ping".to_string(),
            seen: tx,
        }));

        // ".ping hello" with no builtin "ping": goes to the plugin
        let bob = user("bob", false);
        controller.process_command(|_| panic!("no reply expected"), &host, &bob, "ping hello");

        let (_, event) = rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
        assert_eq!(
            event,
            PluginEvent::CommandMessage {
                session: 9,
                name: "bob".to_string(),
                command: "hello".to_string(),
            }
        );

        host.shutdown();
    }

    #[test]
    fn unknown_command_gets_a_reply() {
        use crate::plugin::NullLoader;

        let dir = tempfile::tempdir().unwrap();
        let controller = Controller::load(dir.path().join("none.txt"));
        let host = PluginHost::new(Box::new(NullLoader));

        let replies = Mutex::new(Vec::new());
        let bob = user("bob", false);
        controller.process_command(
            |text| replies.lock().unwrap().push(text),
            &host,
            &bob,
            "frobnicate now",
        );

        assert_eq!(
            *replies.lock().unwrap(),
            vec!["unknown command 'frobnicate'".to_string()]
        );
    }

    #[test]
    fn load_requires_admin() {
        use crate::plugin::NullLoader;

        let dir = tempfile::tempdir().unwrap();
        let controller = Controller::load(dir.path().join("none.txt"));
        let host = PluginHost::new(Box::new(NullLoader));

        let replies = Mutex::new(Vec::new());
        let bob = user("bob", true);
        controller.process_command(
            |text| replies.lock().unwrap().push(text),
            &host,
            &bob,
            "load privileges",
        );

        assert!(replies.lock().unwrap()[0].starts_with("privilege violation"));
    }

    #[test]
    fn effective_privilege_falls_back_to_flags() {
        let dir = tempfile::tempdir().unwrap();
        let controller = Controller::load(dir.path().join("none.txt"));

        assert_eq!(controller.privilege_of(&user("x", false)), Privilege::Normal);
        assert_eq!(
            controller.privilege_of(&user("x", true)),
            Privilege::Authenticated
        );
    }
}
