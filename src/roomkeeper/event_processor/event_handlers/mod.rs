mod handle_account_data;
mod handle_membership;
mod handle_message;
mod handle_receipts;
mod handle_relations;
mod handle_typing;
