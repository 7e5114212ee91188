mod openai;
mod pipeline;
mod sqlite_store;
