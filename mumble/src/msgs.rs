//! Control-channel message bodies, Mumble protocol 1.2.x.
//!
//! Hand-declared `prost` structs with the upstream field tags; repeated
//! scalars stay unpacked for proto2 wire compatibility. The numeric packet
//! ids live in [`id`] and are assigned by position in the protocol, see
//! [`crate::control`].

/// Packet type ids, in protocol order.
pub mod id {
    pub const VERSION: u16 = 0;
    pub const UDP_TUNNEL: u16 = 1;
    pub const AUTHENTICATE: u16 = 2;
    pub const PING: u16 = 3;
    pub const REJECT: u16 = 4;
    pub const SERVER_SYNC: u16 = 5;
    pub const CHANNEL_REMOVE: u16 = 6;
    pub const CHANNEL_STATE: u16 = 7;
    pub const USER_REMOVE: u16 = 8;
    pub const USER_STATE: u16 = 9;
    pub const BAN_LIST: u16 = 10;
    pub const TEXT_MESSAGE: u16 = 11;
    pub const PERMISSION_DENIED: u16 = 12;
    pub const ACL: u16 = 13;
    pub const QUERY_USERS: u16 = 14;
    pub const CRYPT_SETUP: u16 = 15;
    pub const CONTEXT_ACTION_MODIFY: u16 = 16;
    pub const CONTEXT_ACTION: u16 = 17;
    pub const USER_LIST: u16 = 18;
    pub const VOICE_TARGET: u16 = 19;
    pub const PERMISSION_QUERY: u16 = 20;
    pub const CODEC_VERSION: u16 = 21;
    pub const USER_STATS: u16 = 22;
    pub const REQUEST_BLOB: u16 = 23;
    pub const SERVER_CONFIG: u16 = 24;
    pub const SUGGEST_CONFIG: u16 = 25;
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Version {
    #[prost(uint32, optional, tag = "1")]
    pub version: Option<u32>,
    #[prost(string, optional, tag = "2")]
    pub release: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub os: Option<String>,
    #[prost(string, optional, tag = "4")]
    pub os_version: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Authenticate {
    #[prost(string, optional, tag = "1")]
    pub username: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub password: Option<String>,
    #[prost(string, repeated, tag = "3")]
    pub tokens: Vec<String>,
    #[prost(int32, repeated, packed = "false", tag = "4")]
    pub celt_versions: Vec<i32>,
    #[prost(bool, optional, tag = "5")]
    pub opus: Option<bool>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Ping {
    #[prost(uint64, optional, tag = "1")]
    pub timestamp: Option<u64>,
    #[prost(uint32, optional, tag = "2")]
    pub good: Option<u32>,
    #[prost(uint32, optional, tag = "3")]
    pub late: Option<u32>,
    #[prost(uint32, optional, tag = "4")]
    pub lost: Option<u32>,
    #[prost(uint32, optional, tag = "5")]
    pub resync: Option<u32>,
    #[prost(uint32, optional, tag = "6")]
    pub udp_packets: Option<u32>,
    #[prost(uint32, optional, tag = "7")]
    pub tcp_packets: Option<u32>,
    #[prost(float, optional, tag = "8")]
    pub udp_ping_avg: Option<f32>,
    #[prost(float, optional, tag = "9")]
    pub udp_ping_var: Option<f32>,
    #[prost(float, optional, tag = "10")]
    pub tcp_ping_avg: Option<f32>,
    #[prost(float, optional, tag = "11")]
    pub tcp_ping_var: Option<f32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Reject {
    #[prost(int32, optional, tag = "1")]
    pub reject_type: Option<i32>,
    #[prost(string, optional, tag = "2")]
    pub reason: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerSync {
    #[prost(uint32, optional, tag = "1")]
    pub session: Option<u32>,
    #[prost(uint32, optional, tag = "2")]
    pub max_bandwidth: Option<u32>,
    #[prost(string, optional, tag = "3")]
    pub welcome_text: Option<String>,
    #[prost(uint64, optional, tag = "4")]
    pub permissions: Option<u64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChannelRemove {
    #[prost(uint32, optional, tag = "1")]
    pub channel_id: Option<u32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChannelState {
    #[prost(uint32, optional, tag = "1")]
    pub channel_id: Option<u32>,
    #[prost(uint32, optional, tag = "2")]
    pub parent: Option<u32>,
    #[prost(string, optional, tag = "3")]
    pub name: Option<String>,
    #[prost(uint32, repeated, packed = "false", tag = "4")]
    pub links: Vec<u32>,
    #[prost(string, optional, tag = "5")]
    pub description: Option<String>,
    #[prost(uint32, repeated, packed = "false", tag = "6")]
    pub links_add: Vec<u32>,
    #[prost(uint32, repeated, packed = "false", tag = "7")]
    pub links_remove: Vec<u32>,
    #[prost(bool, optional, tag = "8")]
    pub temporary: Option<bool>,
    #[prost(int32, optional, tag = "9")]
    pub position: Option<i32>,
    #[prost(bytes = "vec", optional, tag = "10")]
    pub description_hash: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UserRemove {
    #[prost(uint32, optional, tag = "1")]
    pub session: Option<u32>,
    #[prost(uint32, optional, tag = "2")]
    pub actor: Option<u32>,
    #[prost(string, optional, tag = "3")]
    pub reason: Option<String>,
    #[prost(bool, optional, tag = "4")]
    pub ban: Option<bool>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UserState {
    #[prost(uint32, optional, tag = "1")]
    pub session: Option<u32>,
    #[prost(uint32, optional, tag = "2")]
    pub actor: Option<u32>,
    #[prost(string, optional, tag = "3")]
    pub name: Option<String>,
    #[prost(uint32, optional, tag = "4")]
    pub user_id: Option<u32>,
    #[prost(uint32, optional, tag = "5")]
    pub channel_id: Option<u32>,
    #[prost(bool, optional, tag = "6")]
    pub mute: Option<bool>,
    #[prost(bool, optional, tag = "7")]
    pub deaf: Option<bool>,
    #[prost(bool, optional, tag = "8")]
    pub suppress: Option<bool>,
    #[prost(bool, optional, tag = "9")]
    pub self_mute: Option<bool>,
    #[prost(bool, optional, tag = "10")]
    pub self_deaf: Option<bool>,
    #[prost(bytes = "vec", optional, tag = "11")]
    pub texture: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "12")]
    pub plugin_context: Option<Vec<u8>>,
    #[prost(string, optional, tag = "13")]
    pub plugin_identity: Option<String>,
    #[prost(string, optional, tag = "14")]
    pub comment: Option<String>,
    #[prost(string, optional, tag = "15")]
    pub hash: Option<String>,
    #[prost(bytes = "vec", optional, tag = "16")]
    pub comment_hash: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "17")]
    pub texture_hash: Option<Vec<u8>>,
    #[prost(bool, optional, tag = "18")]
    pub priority_speaker: Option<bool>,
    #[prost(bool, optional, tag = "19")]
    pub recording: Option<bool>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BanList {
    #[prost(message, repeated, tag = "1")]
    pub bans: Vec<ban_list::BanEntry>,
    #[prost(bool, optional, tag = "2")]
    pub query: Option<bool>,
}

pub mod ban_list {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct BanEntry {
        #[prost(bytes = "vec", optional, tag = "1")]
        pub address: Option<Vec<u8>>,
        #[prost(uint32, optional, tag = "2")]
        pub mask: Option<u32>,
        #[prost(string, optional, tag = "3")]
        pub name: Option<String>,
        #[prost(string, optional, tag = "4")]
        pub hash: Option<String>,
        #[prost(string, optional, tag = "5")]
        pub reason: Option<String>,
        #[prost(string, optional, tag = "6")]
        pub start: Option<String>,
        #[prost(uint32, optional, tag = "7")]
        pub duration: Option<u32>,
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TextMessage {
    #[prost(uint32, optional, tag = "1")]
    pub actor: Option<u32>,
    #[prost(uint32, repeated, packed = "false", tag = "2")]
    pub session: Vec<u32>,
    #[prost(uint32, repeated, packed = "false", tag = "3")]
    pub channel_id: Vec<u32>,
    #[prost(uint32, repeated, packed = "false", tag = "4")]
    pub tree_id: Vec<u32>,
    #[prost(string, optional, tag = "5")]
    pub message: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PermissionDenied {
    #[prost(uint32, optional, tag = "1")]
    pub permission: Option<u32>,
    #[prost(uint32, optional, tag = "2")]
    pub channel_id: Option<u32>,
    #[prost(uint32, optional, tag = "3")]
    pub session: Option<u32>,
    #[prost(string, optional, tag = "4")]
    pub reason: Option<String>,
    #[prost(int32, optional, tag = "5")]
    pub deny_type: Option<i32>,
    #[prost(string, optional, tag = "6")]
    pub name: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Acl {
    #[prost(uint32, optional, tag = "1")]
    pub channel_id: Option<u32>,
    #[prost(bool, optional, tag = "2")]
    pub inherit_acls: Option<bool>,
    #[prost(message, repeated, tag = "3")]
    pub groups: Vec<acl::ChanGroup>,
    #[prost(message, repeated, tag = "4")]
    pub acls: Vec<acl::ChanAcl>,
    #[prost(bool, optional, tag = "5")]
    pub query: Option<bool>,
}

pub mod acl {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ChanGroup {
        #[prost(string, optional, tag = "1")]
        pub name: Option<String>,
        #[prost(bool, optional, tag = "2")]
        pub inherited: Option<bool>,
        #[prost(bool, optional, tag = "3")]
        pub inherit: Option<bool>,
        #[prost(bool, optional, tag = "4")]
        pub inheritable: Option<bool>,
        #[prost(uint32, repeated, packed = "false", tag = "5")]
        pub add: Vec<u32>,
        #[prost(uint32, repeated, packed = "false", tag = "6")]
        pub remove: Vec<u32>,
        #[prost(uint32, repeated, packed = "false", tag = "7")]
        pub inherited_members: Vec<u32>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ChanAcl {
        #[prost(bool, optional, tag = "1")]
        pub apply_here: Option<bool>,
        #[prost(bool, optional, tag = "2")]
        pub apply_subs: Option<bool>,
        #[prost(bool, optional, tag = "3")]
        pub inherited: Option<bool>,
        #[prost(uint32, optional, tag = "4")]
        pub user_id: Option<u32>,
        #[prost(string, optional, tag = "5")]
        pub group: Option<String>,
        #[prost(uint32, optional, tag = "6")]
        pub grant: Option<u32>,
        #[prost(uint32, optional, tag = "7")]
        pub deny: Option<u32>,
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QueryUsers {
    #[prost(uint32, repeated, packed = "false", tag = "1")]
    pub ids: Vec<u32>,
    #[prost(string, repeated, tag = "2")]
    pub names: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CryptSetup {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub key: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub client_nonce: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub server_nonce: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContextActionModify {
    #[prost(string, optional, tag = "1")]
    pub action: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub text: Option<String>,
    #[prost(uint32, optional, tag = "3")]
    pub context: Option<u32>,
    #[prost(int32, optional, tag = "4")]
    pub operation: Option<i32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContextAction {
    #[prost(uint32, optional, tag = "1")]
    pub session: Option<u32>,
    #[prost(uint32, optional, tag = "2")]
    pub channel_id: Option<u32>,
    #[prost(string, optional, tag = "3")]
    pub action: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UserList {
    #[prost(message, repeated, tag = "1")]
    pub users: Vec<user_list::User>,
}

pub mod user_list {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct User {
        #[prost(uint32, optional, tag = "1")]
        pub user_id: Option<u32>,
        #[prost(string, optional, tag = "2")]
        pub name: Option<String>,
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VoiceTarget {
    #[prost(uint32, optional, tag = "1")]
    pub id: Option<u32>,
    #[prost(message, repeated, tag = "2")]
    pub targets: Vec<voice_target::Target>,
}

pub mod voice_target {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Target {
        #[prost(uint32, repeated, packed = "false", tag = "1")]
        pub session: Vec<u32>,
        #[prost(uint32, optional, tag = "2")]
        pub channel_id: Option<u32>,
        #[prost(string, optional, tag = "3")]
        pub group: Option<String>,
        #[prost(bool, optional, tag = "4")]
        pub links: Option<bool>,
        #[prost(bool, optional, tag = "5")]
        pub children: Option<bool>,
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PermissionQuery {
    #[prost(uint32, optional, tag = "1")]
    pub channel_id: Option<u32>,
    #[prost(uint32, optional, tag = "2")]
    pub permissions: Option<u32>,
    #[prost(bool, optional, tag = "3")]
    pub flush: Option<bool>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CodecVersion {
    #[prost(int32, optional, tag = "1")]
    pub alpha: Option<i32>,
    #[prost(int32, optional, tag = "2")]
    pub beta: Option<i32>,
    #[prost(bool, optional, tag = "3")]
    pub prefer_alpha: Option<bool>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UserStats {
    #[prost(uint32, optional, tag = "1")]
    pub session: Option<u32>,
    #[prost(bool, optional, tag = "2")]
    pub stats_only: Option<bool>,
    #[prost(bytes = "vec", repeated, tag = "3")]
    pub certificates: Vec<Vec<u8>>,
    #[prost(message, optional, tag = "4")]
    pub from_client: Option<user_stats::Stats>,
    #[prost(message, optional, tag = "5")]
    pub from_server: Option<user_stats::Stats>,
    #[prost(uint32, optional, tag = "6")]
    pub udp_packets: Option<u32>,
    #[prost(uint32, optional, tag = "7")]
    pub tcp_packets: Option<u32>,
    #[prost(float, optional, tag = "8")]
    pub udp_ping_avg: Option<f32>,
    #[prost(float, optional, tag = "9")]
    pub udp_ping_var: Option<f32>,
    #[prost(float, optional, tag = "10")]
    pub tcp_ping_avg: Option<f32>,
    #[prost(float, optional, tag = "11")]
    pub tcp_ping_var: Option<f32>,
    #[prost(message, optional, tag = "12")]
    pub version: Option<Version>,
    #[prost(int32, repeated, packed = "false", tag = "13")]
    pub celt_versions: Vec<i32>,
    #[prost(bytes = "vec", optional, tag = "14")]
    pub address: Option<Vec<u8>>,
    #[prost(uint32, optional, tag = "15")]
    pub bandwidth: Option<u32>,
    #[prost(uint32, optional, tag = "16")]
    pub onlinesecs: Option<u32>,
    #[prost(uint32, optional, tag = "17")]
    pub idlesecs: Option<u32>,
}

pub mod user_stats {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Stats {
        #[prost(uint32, optional, tag = "1")]
        pub good: Option<u32>,
        #[prost(uint32, optional, tag = "2")]
        pub late: Option<u32>,
        #[prost(uint32, optional, tag = "3")]
        pub lost: Option<u32>,
        #[prost(uint32, optional, tag = "4")]
        pub resync: Option<u32>,
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RequestBlob {
    #[prost(uint32, repeated, packed = "false", tag = "1")]
    pub session_texture: Vec<u32>,
    #[prost(uint32, repeated, packed = "false", tag = "2")]
    pub session_comment: Vec<u32>,
    #[prost(uint32, repeated, packed = "false", tag = "3")]
    pub channel_description: Vec<u32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerConfig {
    #[prost(uint32, optional, tag = "1")]
    pub max_bandwidth: Option<u32>,
    #[prost(string, optional, tag = "2")]
    pub welcome_text: Option<String>,
    #[prost(bool, optional, tag = "3")]
    pub allow_html: Option<bool>,
    #[prost(uint32, optional, tag = "4")]
    pub message_length: Option<u32>,
    #[prost(uint32, optional, tag = "5")]
    pub image_message_length: Option<u32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SuggestConfig {
    #[prost(uint32, optional, tag = "1")]
    pub version: Option<u32>,
    #[prost(bool, optional, tag = "2")]
    pub positional: Option<bool>,
    #[prost(bool, optional, tag = "3")]
    pub push_to_talk: Option<bool>,
}
