pub mod accept_key;
