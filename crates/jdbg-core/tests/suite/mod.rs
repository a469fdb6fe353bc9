mod breakpoints;
mod evaluation;
mod events;
mod sessions;
