mod bridge;
mod records;
mod scope;
