pub mod caldav;
pub mod imap_inbox;
pub mod webdriver;
