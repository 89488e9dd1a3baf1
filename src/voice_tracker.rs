use serenity::all::ActivityData;
use serenity::all::CommandDataOptionValue;
use serenity::all::CommandInteraction;
use serenity::all::CreateEmbed;
use serenity::all::CreateInteractionResponse;
use serenity::all::CreateInteractionResponseMessage;
use serenity::all::CreateMessage;
use serenity::all::Interaction;
use serenity::all::Message;
use serenity::all::Ready;
use serenity::async_trait;
use serenity::model::Timestamp;
use serenity::model::id::{ChannelId, GuildId, UserId};
use serenity::model::voice::VoiceState;
use serenity::prelude::*;
use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::accounting::{Accounting, Transition};
use crate::config::Config;
use crate::duration::parse_duration;
use crate::report::{self, EMPTY_RANKING, RANKING_COLOUR, RANKING_TITLE};
use crate::session::Presence;

pub struct VoiceHandler {
    accounting: Arc<Accounting>,
    guild_id: GuildId,
    prefix: String,
    ranking_limit: usize,
    save_interval: Duration,
    // Ready fires again on every reconnect; the timer must start once.
    timer_started: AtomicBool,
}

#[derive(Debug, PartialEq)]
enum BotCommand {
    Ranking,
    AddTime(Option<String>),
}

fn parse_command(prefix: &str, content: &str) -> Option<BotCommand> {
    let rest = content.trim().strip_prefix(prefix)?;
    let mut parts = rest.split_whitespace();
    match parts.next()? {
        "te" => Some(BotCommand::Ranking),
        "addtime" => Some(BotCommand::AddTime(parts.next().map(str::to_string))),
        _ => None,
    }
}

/// Checks permission and argument of an admin addition. `Err` carries the
/// rejection shown to the caller.
fn admin_add_amount(arg: Option<&str>, is_admin: bool) -> Result<u64, String> {
    if !is_admin {
        return Err("You need the Administrator permission to use this command.".to_string());
    }
    let arg = arg.ok_or_else(|| "Usage: addtime <duration>, e.g. 1h30m, 45m or 30s.".to_string())?;
    parse_duration(arg)
        .map_err(|e| format!("Invalid duration `{}`: {}. Use a format like 1h30m, 45m or 30s.", arg, e))
}

/// Only humans in the tracked guild count. An unknown author is skipped.
fn is_tracked(tracked: GuildId, guild_id: Option<GuildId>, is_bot: Option<bool>) -> bool {
    guild_id == Some(tracked) && is_bot == Some(false)
}

fn presence_of(channel_id: Option<ChannelId>, server_mute: bool, self_mute: bool) -> Presence {
    Presence {
        in_channel: channel_id.is_some(),
        server_mute,
        self_mute,
    }
}

fn voice_presence(state: &VoiceState) -> Presence {
    presence_of(state.channel_id, state.mute, state.self_mute)
}

fn member_id(user_id: &str) -> Option<UserId> {
    user_id.parse::<u64>().ok().filter(|id| *id != 0).map(UserId::new)
}

fn name_or_raw<E: Display>(user_id: &str, lookup: Result<String, E>) -> String {
    lookup.unwrap_or_else(|e| {
        warn!(user_id, error = %e, "member lookup failed, showing raw id");
        user_id.to_string()
    })
}

async fn publish_status(ctx: &Context, accounting: &Accounting) {
    let text = report::status_text(accounting.total_ms().await);
    ctx.set_activity(Some(ActivityData::watching(text)));
}

impl VoiceHandler {
    pub fn new(accounting: Arc<Accounting>, config: &Config) -> Self {
        Self {
            accounting,
            guild_id: config.guild_id,
            prefix: config.command_prefix.clone(),
            ranking_limit: config.ranking_limit,
            save_interval: config.save_interval,
            timer_started: AtomicBool::new(false),
        }
    }

    fn start_timer(&self, ctx: &Context) {
        if self.timer_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let ctx = ctx.clone();
        let accounting = self.accounting.clone();
        let period = self.save_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                publish_status(&ctx, &accounting).await;
                if let Err(e) = accounting.flush().await {
                    error!(error = %e, "periodic flush failed");
                }
            }
        });
    }

    async fn display_name(&self, ctx: &Context, user_id: &str) -> String {
        let Some(id) = member_id(user_id) else {
            return user_id.to_string();
        };
        let lookup = self
            .guild_id
            .member(ctx, id)
            .await
            .map(|member| member.display_name().to_string());
        name_or_raw(user_id, lookup)
    }

    async fn ranking_embed(&self, ctx: &Context) -> Option<CreateEmbed> {
        let ranked = self.accounting.ranking(self.ranking_limit).await;
        if ranked.is_empty() {
            return None;
        }
        let mut rows = Vec::with_capacity(ranked.len());
        for (user_id, total) in ranked {
            rows.push((self.display_name(ctx, &user_id).await, total));
        }
        Some(
            CreateEmbed::new()
                .title(RANKING_TITLE)
                .colour(RANKING_COLOUR)
                .description(report::ranking_description(&rows))
                .timestamp(Timestamp::now()),
        )
    }

    async fn add_time(&self, ctx: &Context, arg: Option<&str>, is_admin: bool) -> String {
        let ms = match admin_add_amount(arg, is_admin) {
            Ok(ms) => ms,
            Err(reply) => {
                warn!(arg = ?arg, is_admin, "addtime rejected");
                return reply;
            }
        };
        let users = self.accounting.add_to_all(ms).await;
        publish_status(ctx, &self.accounting).await;
        format!("Added {} to {} tracked users.", report::format_time(ms), users)
    }

    async fn handle_slash(&self, ctx: &Context, cmd: &CommandInteraction) {
        let message = match cmd.data.name.as_str() {
            "te" => match self.ranking_embed(ctx).await {
                Some(embed) => CreateInteractionResponseMessage::new().embed(embed),
                None => CreateInteractionResponseMessage::new().content(EMPTY_RANKING),
            },
            "addtime" => {
                let arg = cmd
                    .data
                    .options
                    .iter()
                    .find(|o| o.name == "duration")
                    .and_then(|o| match &o.value {
                        CommandDataOptionValue::String(s) => Some(s.as_str()),
                        _ => None,
                    });
                let is_admin = cmd
                    .member
                    .as_ref()
                    .and_then(|member| member.permissions)
                    .is_some_and(|permissions| permissions.administrator());
                CreateInteractionResponseMessage::new().content(self.add_time(ctx, arg, is_admin).await)
            }
            _ => return,
        };

        if let Err(e) = cmd
            .create_response(&ctx.http, CreateInteractionResponse::Message(message))
            .await
        {
            warn!(command = %cmd.data.name, error = %e, "failed to answer command");
        }
    }

    async fn handle_text(&self, ctx: &Context, msg: &Message, command: BotCommand) {
        let sent = match command {
            BotCommand::Ranking => match self.ranking_embed(ctx).await {
                Some(embed) => msg
                    .channel_id
                    .send_message(&ctx.http, CreateMessage::new().embed(embed))
                    .await,
                None => msg.reply(ctx, EMPTY_RANKING).await,
            },
            BotCommand::AddTime(arg) => {
                let is_admin = author_is_admin(ctx, msg).await;
                let reply = self.add_time(ctx, arg.as_deref(), is_admin).await;
                msg.reply(ctx, reply).await
            }
        };
        if let Err(e) = sent {
            warn!(error = %e, "failed to answer text command");
        }
    }
}

async fn author_is_admin(ctx: &Context, msg: &Message) -> bool {
    let Some(guild_id) = msg.guild_id else {
        return false;
    };
    let member = match msg.member(ctx).await {
        Ok(member) => member,
        Err(e) => {
            warn!(user = %msg.author.id, error = %e, "could not resolve command author");
            return false;
        }
    };
    match ctx.cache.guild(guild_id) {
        Some(guild) => guild.member_permissions(&member).administrator(),
        None => {
            warn!(guild = %guild_id, "guild not cached, cannot check permissions");
            false
        }
    }
}

#[async_trait]
impl EventHandler for VoiceHandler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!(user = %ready.user.name, guild = %self.guild_id, "bot is ready");
        publish_status(&ctx, &self.accounting).await;
        self.start_timer(&ctx);
    }

    async fn voice_state_update(&self, _ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let is_bot = new.member.as_ref().map(|member| member.user.bot);
        if !is_tracked(self.guild_id, new.guild_id, is_bot) {
            return;
        }

        let user_id = new.user_id.to_string();
        let name = new
            .member
            .as_ref()
            .map_or_else(|| user_id.clone(), |member| member.display_name().to_string());
        let before = old.as_ref().map(voice_presence).unwrap_or_default();

        match self
            .accounting
            .presence_changed(&user_id, before, voice_presence(&new))
            .await
        {
            Transition::Opened => info!(user = %name, "started counting"),
            Transition::Closed { session_ms, .. } => {
                info!(user = %name, session_secs = session_ms / 1000, "stopped counting")
            }
            Transition::Unchanged => {}
        }
    }

    async fn message(&self, ctx: Context, msg: Message) {
        if msg.author.bot || msg.guild_id != Some(self.guild_id) {
            return;
        }
        if let Some(command) = parse_command(&self.prefix, &msg.content) {
            self.handle_text(&ctx, &msg, command).await;
        }
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        if let Interaction::Command(cmd) = interaction {
            if cmd.guild_id == Some(self.guild_id) {
                self.handle_slash(&ctx, &cmd).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_text_commands() {
        assert_eq!(parse_command("!", "!te"), Some(BotCommand::Ranking));
        assert_eq!(parse_command("!", "  !te  "), Some(BotCommand::Ranking));
        assert_eq!(parse_command("!", "!ranking"), None);
        assert_eq!(
            parse_command("!", "!addtime 1h30m"),
            Some(BotCommand::AddTime(Some("1h30m".to_string())))
        );
        assert_eq!(parse_command("!", "!addtime"), Some(BotCommand::AddTime(None)));
        assert_eq!(parse_command("!", "te"), None);
        assert_eq!(parse_command("!", "!unknown"), None);
        assert_eq!(parse_command("!", "!"), None);
        assert_eq!(parse_command("vt!", "vt!te"), Some(BotCommand::Ranking));
    }

    #[test]
    fn tracks_only_humans_in_the_configured_guild() {
        let tracked = GuildId::new(10);
        assert!(is_tracked(tracked, Some(tracked), Some(false)));
        assert!(!is_tracked(tracked, Some(GuildId::new(11)), Some(false)));
        assert!(!is_tracked(tracked, None, Some(false)));
        assert!(!is_tracked(tracked, Some(tracked), Some(true)));
        assert!(!is_tracked(tracked, Some(tracked), None));
    }

    #[test]
    fn maps_voice_flags_to_presence() {
        let channel = Some(ChannelId::new(5));
        assert!(presence_of(channel, false, false).is_countable());
        assert!(!presence_of(None, false, false).is_countable());
        assert_eq!(
            presence_of(channel, true, false),
            Presence { in_channel: true, server_mute: true, self_mute: false }
        );
        assert!(!presence_of(channel, true, false).is_countable());
        assert_eq!(
            presence_of(channel, false, true),
            Presence { in_channel: true, server_mute: false, self_mute: true }
        );
        assert!(!presence_of(channel, false, true).is_countable());
    }

    #[test]
    fn member_id_rejects_unusable_ids() {
        assert_eq!(member_id("123456789"), Some(UserId::new(123_456_789)));
        assert_eq!(member_id("0"), None);
        assert_eq!(member_id("bookkeeping"), None);
        assert_eq!(member_id(""), None);
    }

    #[test]
    fn failed_lookup_falls_back_to_raw_id() {
        assert_eq!(name_or_raw::<&str>("42", Ok("Alice".to_string())), "Alice");
        assert_eq!(name_or_raw("42", Err("Unknown Member")), "42");
    }

    #[test]
    fn admin_add_checks_permission_before_parsing() {
        assert!(admin_add_amount(Some("1h"), false)
            .unwrap_err()
            .contains("Administrator"));
        assert!(admin_add_amount(Some("abc"), false)
            .unwrap_err()
            .contains("Administrator"));
    }

    #[test]
    fn admin_add_parses_duration() {
        assert_eq!(admin_add_amount(Some("1h30m"), true), Ok(5_400_000));
        assert_eq!(admin_add_amount(Some("0h"), true), Ok(0));
        assert!(admin_add_amount(Some("abc"), true).unwrap_err().contains("Invalid duration"));
        assert!(admin_add_amount(None, true).unwrap_err().starts_with("Usage"));
    }
}
