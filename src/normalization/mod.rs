pub mod bbcode;
pub mod cook;
pub mod slug;
pub mod text;
