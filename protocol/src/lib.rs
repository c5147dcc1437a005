//! The wire protocol shared between the server and its clients. Every live
//! message travels as a JSON framed envelope `{event, channel?, body}`, both
//! inbound and outbound. Also contains the channel addresses for the pub/sub
//! routing and the user visible error taxonomy.

use engine::{Color, Coord, PieceKind};
use serde::{Deserialize, Serialize};

/// The buffer size for the per connection outbound channels.
pub const CHANNEL_BUFFER_SIZE: usize = 256;

// Inbound intent labels (client -> server).

/// A player submits a ply for a game.
pub const PLY: &str = "ply";
/// A chat message for a game channel.
pub const SEND_CHAT_MESSAGE: &str = "send_chat_message";
/// Create, cancel, accept or decline a draw or takeback offer.
pub const PERFORM_OFFER_ACTION: &str = "perform_offer_action";
/// Gift the configured amount of seconds to the opponent.
pub const ADD_TIME: &str = "add_time";
/// Resign the game (aborts instead when barely any plies were made).
pub const RESIGN: &str = "resign";
/// Subscribe the connection to a channel.
pub const SUBSCRIBE: &str = "subscribe";
/// Drop the subscription of the connection for a channel.
pub const UNSUBSCRIBE: &str = "unsubscribe";
/// The keep alive beat, answered with a textual `pong`.
pub const PING: &str = "ping";

// Outbound event labels (server -> client).

pub const NEW_PLY: &str = "new_ply";
pub const NEW_CHAT_MESSAGE: &str = "new_chat_message";
pub const OFFER_ACTION_PERFORMED: &str = "offer_action_performed";
pub const TIME_ADDED: &str = "time_added";
pub const ROLLBACK: &str = "rollback";
pub const GAME_ENDED: &str = "game_ended";
pub const GAME_STARTED: &str = "game_started";
pub const NEW_ACTIVE_GAME: &str = "new_active_game";
pub const NEW_RECENT_GAME: &str = "new_recent_game";
pub const SERVER_SHUTDOWN: &str = "server_shutdown";
/// The error reply sent to the initiator of a refused intent.
pub const ERROR: &str = "error";
/// Presence change on a watched channel.
pub const SUBSCRIBER_UPDATE: &str = "subscriber_update";

/// The JSON frame every live message is wrapped into.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Envelope {
    /// The event label, see the constants of this crate.
    pub event: String,
    /// The channel the message belongs to, where meaningful.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<Channel>,
    /// The event specific payload.
    #[serde(default)]
    pub body: serde_json::Value,
}

impl Envelope {
    /// Builds an outbound envelope without a channel.
    pub fn event(event: &str, body: serde_json::Value) -> Envelope {
        Envelope {
            event: event.to_string(),
            channel: None,
            body,
        }
    }

    /// Builds an outbound envelope addressed to a channel.
    pub fn on_channel(event: &str, channel: Channel, body: serde_json::Value) -> Envelope {
        Envelope {
            event: event.to_string(),
            channel: Some(channel),
            body,
        }
    }

    /// The synthetic state refresh for a channel the client just joined or
    /// needs to resync with.
    pub fn refresh(channel: Channel, body: serde_json::Value) -> Envelope {
        Envelope {
            event: format!("refresh.{}", channel.group()),
            channel: Some(channel),
            body,
        }
    }
}

/// A value typed topic address. Two channels are the same topic iff they are
/// equal, the registry keys its subscriber maps by this equality.
#[derive(Serialize, Deserialize, PartialEq, Eq, Hash, Debug, Clone)]
#[serde(tag = "group", rename_all = "snake_case")]
pub enum Channel {
    /// Every connection, used for the shutdown announcement.
    Everyone,
    /// The public challenges feed.
    PublicChallengeList,
    /// The global started/ended games feed.
    GameList,
    /// Direct challenges addressed to a user.
    IncomingChallenges { user: String },
    /// Notifications about challenges a user issued.
    OutgoingChallenges { user: String },
    /// The per game event stream.
    #[serde(rename = "game.main")]
    GameMain { game_id: String },
    /// "A game has started for player X".
    #[serde(rename = "player.started_games")]
    PlayerStartedGames { watched: String },
    /// Presence notifications for another channel.
    SubscriberList { channel: Box<Channel> },
}

impl Channel {
    /// The group label used for routing and the `refresh.<group>` events.
    pub fn group(&self) -> &'static str {
        match self {
            Channel::Everyone => "everyone",
            Channel::PublicChallengeList => "public_challenge_list",
            Channel::GameList => "game_list",
            Channel::IncomingChallenges { .. } => "incoming_challenges",
            Channel::OutgoingChallenges { .. } => "outgoing_challenges",
            Channel::GameMain { .. } => "game.main",
            Channel::PlayerStartedGames { .. } => "player.started_games",
            Channel::SubscriberList { .. } => "subscriber_list",
        }
    }
}

/// An annotation on a subscription used by the broadcast filters.
#[derive(Serialize, Deserialize, PartialEq, Eq, Hash, Debug, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum SubscriberTag {
    /// Marks the two playing connections of a game channel, so spectator chat
    /// can be kept away from the pair.
    ParticipatingPlayer,
}

/// The two offer kinds of the live game.
#[derive(Serialize, Deserialize, PartialEq, Eq, Hash, Debug, Clone, Copy)]
#[serde(rename_all = "UPPERCASE")]
pub enum OfferKind {
    Draw,
    Takeback,
}

/// What happens to an offer.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone, Copy)]
#[serde(rename_all = "UPPERCASE")]
pub enum OfferAction {
    Create,
    Cancel,
    Accept,
    Decline,
}

/// How a game ended. The drawish kinds carry no winner.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeKind {
    Fatum,
    Breakthrough,
    Timeout,
    Resign,
    Abandon,
    DrawAgreement,
    Repetition,
    NoProgress,
    Abort,
}

impl OutcomeKind {
    /// Checks if the kind admits a winner at all.
    pub fn is_drawish(&self) -> bool {
        matches!(
            self,
            OutcomeKind::DrawAgreement
                | OutcomeKind::Repetition
                | OutcomeKind::NoProgress
                | OutcomeKind::Abort
        )
    }
}

/// The activity status of a user inside a channel. The order goes from least
/// to most active, so the maximum over connections picks the liveliest one.
#[derive(Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Debug, Clone, Copy)]
#[serde(rename_all = "UPPERCASE")]
pub enum UserStatus {
    Offline,
    Away,
    Online,
}

/// The user visible error surfaces.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    ValidationError,
    AuthError,
    UnknownEvent,
    ProcessingError,
}

/// The `{error, details}` reply sent to the initiator of a refused intent.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ErrorBody {
    pub error: ErrorKind,
    pub details: String,
}

// Intent bodies.

/// Body of the `ply` intent.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PlyIntent {
    pub game_id: String,
    pub from: Coord,
    pub to: Coord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub morph_into: Option<PieceKind>,
    /// The SIP the client saw when it made the ply, used to detect races.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_sip: Option<String>,
}

/// Body of the `send_chat_message` intent.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ChatIntent {
    pub game_id: String,
    pub text: String,
}

/// Body of the `perform_offer_action` intent.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct OfferIntent {
    pub game_id: String,
    pub offer_kind: OfferKind,
    pub action: OfferAction,
}

/// Body of the `add_time` and `resign` intents.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GameIntent {
    pub game_id: String,
}

/// Body of the `ping` intent. The client may report its latest front end
/// activity as a unix second.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct PingIntent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<i64>,
}

/// Explicit clock reserves reported by an external uploader together with a ply.
#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct TimeRemainders {
    pub white_ms: i64,
    pub black_ms: i64,
}

/// The winner bearing outcome report, as returned by the external append.
#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct OutcomeReport {
    pub kind: OutcomeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winner: Option<Color>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channels_serialize_with_their_group_label() {
        let channel = Channel::GameMain {
            game_id: "abc".into(),
        };
        let json = serde_json::to_value(&channel).unwrap();
        assert_eq!(json["group"], "game.main");
        assert_eq!(json["game_id"], "abc");
        let back: Channel = serde_json::from_value(json).unwrap();
        assert_eq!(back, channel);
    }

    #[test]
    fn nested_subscriber_list_channels_round_trip() {
        let channel = Channel::SubscriberList {
            channel: Box::new(Channel::GameList),
        };
        let json = serde_json::to_string(&channel).unwrap();
        let back: Channel = serde_json::from_str(&json).unwrap();
        assert_eq!(back, channel);
        assert_eq!(channel.group(), "subscriber_list");
    }

    #[test]
    fn envelopes_keep_the_channel_optional() {
        let parsed: Envelope =
            serde_json::from_str(r#"{"event":"ping","body":{"last_activity":17}}"#).unwrap();
        assert_eq!(parsed.event, "ping");
        assert!(parsed.channel.is_none());
        let ping: PingIntent = serde_json::from_value(parsed.body).unwrap();
        assert_eq!(ping.last_activity, Some(17));
    }

    #[test]
    fn refresh_events_carry_the_group_in_the_label() {
        let refresh = Envelope::refresh(Channel::GameList, serde_json::Value::Null);
        assert_eq!(refresh.event, "refresh.game_list");
    }

    #[test]
    fn drawish_outcomes_have_no_winner() {
        assert!(OutcomeKind::Repetition.is_drawish());
        assert!(OutcomeKind::Abort.is_drawish());
        assert!(!OutcomeKind::Fatum.is_drawish());
        assert_eq!(
            serde_json::to_value(OutcomeKind::DrawAgreement).unwrap(),
            "DRAW_AGREEMENT"
        );
    }

    #[test]
    fn statuses_order_from_least_to_most_active() {
        assert!(UserStatus::Online > UserStatus::Away);
        assert!(UserStatus::Away > UserStatus::Offline);
    }
}
